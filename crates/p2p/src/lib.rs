//! # Valcore P2P
//!
//! Gossip transport for validator nodes: authenticated peer connections
//! over length-prefixed TCP frames, signed nonce-tagged envelopes, bounded
//! probabilistic fan-out, and heartbeat-based liveness.
//!
//! The service runs as a single owning task: all peer-table mutation
//! happens inside its event loop, reachable only through [`NetworkHandle`]
//! commands and per-connection channels. Consumers receive decoded traffic
//! as [`NetworkEvent`]s.

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod message;
pub mod network;
pub mod peer;

pub use message::{
    Envelope, HandshakePayload, MessageType, PeerAddr, PeerListPayload, PingPayload,
};
pub use network::{Command, NetworkEvent, NetworkHandle, NetworkService, P2pConfig};
pub use peer::{BanList, PeerInfo, SeenNonces};

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, P2pError>;

/// Transport errors. Connection-level failures (mismatches, capacity,
/// bans) are logged and drop the connection; only these surface as values.
#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    /// Socket or listener I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope failed to decode or carried an unusable payload
    #[error("malformed message: {0}")]
    Malformed(String),

    /// JSON encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The service event loop has shut down
    #[error("network channel closed")]
    ChannelClosed,
}
