//! Wire envelope and typed payloads.
//!
//! Every message on the wire is a signed, nonce-tagged [`Envelope`] encoded
//! as JSON inside a u32 big-endian length-prefixed frame. The nonce feeds
//! gossip deduplication; the signature covers everything except itself.

use crate::{P2pError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use valcore_types::{Signature, Signer};

/// Envelope message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Connection opener declaring chain/network/capabilities
    Handshake,
    /// Handshake accepted
    HandshakeAck,
    /// Liveness check
    Ping,
    /// Liveness reply
    Pong,
    /// Request for known peer addresses
    PeerDiscovery,
    /// Known peer addresses
    PeerList,
    /// Gossip: a finalized block
    NewBlock,
    /// Gossip: a mempool transaction
    NewTransaction,
    /// Gossip: a consensus vote
    Vote,
    /// Request for votes at a height/round
    VoteRequest,
    /// Request for a single block
    BlockRequest,
    /// Reply to a block request
    BlockResponse,
    /// Request for a block range
    SyncRequest,
    /// Reply to a sync request
    SyncResponse,
    /// Gossip: a consensus-internal message (proposal)
    ConsensusMessage,
}

impl MessageType {
    /// Whether first-seen messages of this type are re-gossiped to a
    /// random peer subset.
    pub fn is_gossip(&self) -> bool {
        matches!(
            self,
            Self::NewBlock | Self::NewTransaction | Self::Vote | Self::ConsensusMessage
        )
    }
}

/// A signed, nonce-tagged wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Sender node id
    pub from: String,
    /// Recipient node id for directed messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Type-specific payload
    pub payload: serde_json::Value,
    /// Send time in Unix milliseconds
    pub timestamp: u64,
    /// Sender signature over [`Envelope::signing_bytes`]
    pub signature: Signature,
    /// Random nonce for gossip deduplication
    pub nonce: String,
}

impl Envelope {
    /// Builds an unsigned envelope with a fresh random nonce.
    pub fn new(message_type: MessageType, from: String, payload: serde_json::Value) -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            message_type,
            from,
            to: None,
            payload,
            timestamp: valcore_types::unix_millis(),
            signature: Signature::empty(),
            nonce: hex::encode(nonce),
        }
    }

    /// Sets the recipient for a directed message.
    pub fn directed_to(mut self, node_id: String) -> Self {
        self.to = Some(node_id);
        self
    }

    /// The bytes covered by the sender's signature: every field except the
    /// signature itself, in a fixed order. The payload is rendered through
    /// `serde_json`, whose map keys are ordered, so both sides produce the
    /// same bytes.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(format!("{:?}", self.message_type).as_bytes());
        data.extend_from_slice(self.from.as_bytes());
        if let Some(to) = &self.to {
            data.extend_from_slice(to.as_bytes());
        }
        data.extend_from_slice(self.payload.to_string().as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(self.nonce.as_bytes());
        data
    }

    /// Signs the envelope in place.
    pub fn sign(&mut self, signer: &dyn Signer) {
        self.signature = signer.sign(&self.signing_bytes());
    }

    /// Verifies the envelope signature against the sender's public key.
    pub fn verify(&self, signer: &dyn Signer, public_key: &[u8]) -> bool {
        signer.verify(public_key, &self.signing_bytes(), &self.signature)
    }

    /// JSON-encodes the envelope for framing.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes an envelope from a frame body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| P2pError::Malformed(e.to_string()))
    }

    /// Deserializes the payload into a concrete type.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| P2pError::Malformed(e.to_string()))
    }
}

/// HANDSHAKE payload. The responder closes the connection on any chain or
/// network mismatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Chain id of the sender's network
    pub chain_id: u64,
    /// Human-readable network id
    pub network_id: String,
    /// Sender node id
    pub node_id: String,
    /// Port the sender accepts connections on
    pub listen_port: u16,
    /// Sender public key, hex-encoded
    pub public_key: String,
    /// Protocol capabilities
    pub capabilities: Vec<String>,
}

/// PING/PONG payload. The sequence number is echoed back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    /// Sequence number
    pub seq: u64,
}

/// A dialable peer address in a PEER_LIST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddr {
    /// Node id
    pub node_id: String,
    /// host:port the peer listens on
    pub addr: String,
}

/// PEER_LIST payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListPayload {
    /// Known dialable peers
    pub peers: Vec<PeerAddr>,
}
