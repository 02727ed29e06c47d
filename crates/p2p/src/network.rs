//! The network service: TCP listener, per-connection reader/writer tasks,
//! and the single owning event loop.
//!
//! Frames are a u32 big-endian length prefix followed by a JSON-encoded
//! [`Envelope`]. Connections start untrusted; only a completed handshake
//! (chain id, network id, signature check) admits a peer into the table.
//! All peer-table mutation happens inside [`NetworkService::run`];
//! external callers talk to it through a [`NetworkHandle`].

use crate::message::{Envelope, HandshakePayload, MessageType, PeerAddr, PeerListPayload, PingPayload};
use crate::peer::{BanList, PeerInfo, SeenNonces};
use crate::{P2pError, Result};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use valcore_types::Signer;

/// Network configuration.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Address to listen on; port 0 picks an ephemeral port
    pub listen_addr: String,
    /// Chain id; handshakes with any other chain id are rejected
    pub chain_id: u64,
    /// Network id; handshakes with any other network id are rejected
    pub network_id: String,
    /// Addresses dialed at startup
    pub boot_nodes: Vec<String>,
    /// Below this peer count, discovery broadcasts are issued
    pub min_peers: usize,
    /// Connections beyond this cap are rejected
    pub max_peers: usize,
    /// PING cadence; peers silent for 3x this are dropped
    pub heartbeat_interval: Duration,
    /// Ban-expiry sweep cadence
    pub cleanup_interval: Duration,
    /// Dial timeout
    pub connection_timeout: Duration,
    /// Largest acceptable frame
    pub max_frame_bytes: usize,
    /// Recently-seen nonce set capacity
    pub seen_nonce_capacity: usize,
    /// Default ban duration
    pub default_ban: Duration,
    /// Capabilities declared in our handshake
    pub capabilities: Vec<String>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:30600".to_string(),
            chain_id: 6000,
            network_id: "valcore-devnet".to_string(),
            boot_nodes: Vec::new(),
            min_peers: 3,
            max_peers: 50,
            heartbeat_interval: Duration::from_secs(15),
            cleanup_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(5),
            max_frame_bytes: 4 * 1024 * 1024,
            seen_nonce_capacity: 10_000,
            default_ban: Duration::from_secs(600),
            capabilities: vec!["consensus".to_string(), "sync".to_string()],
        }
    }
}

/// Events emitted to the service's consumer.
#[derive(Debug)]
pub enum NetworkEvent {
    /// The listener is bound
    Listening(SocketAddr),
    /// A peer completed the handshake
    PeerConnected(PeerInfo),
    /// A peer disconnected or was dropped
    PeerDisconnected {
        /// Node id of the departed peer
        node_id: String,
    },
    /// NEW_BLOCK gossip
    Block {
        /// Sender node id
        from: String,
        /// Block payload
        payload: Value,
    },
    /// NEW_TRANSACTION gossip
    Transaction {
        /// Sender node id
        from: String,
        /// Transaction payload
        payload: Value,
    },
    /// VOTE gossip
    Vote {
        /// Sender node id
        from: String,
        /// Vote payload
        payload: Value,
    },
    /// CONSENSUS_MESSAGE gossip
    Consensus {
        /// Sender node id
        from: String,
        /// Consensus payload
        payload: Value,
    },
    /// VOTE_REQUEST / BLOCK_REQUEST / SYNC_REQUEST
    Request {
        /// Sender node id
        from: String,
        /// Full envelope, for typed payload extraction and reply routing
        envelope: Envelope,
    },
    /// BLOCK_RESPONSE / SYNC_RESPONSE
    Response {
        /// Sender node id
        from: String,
        /// Full envelope
        envelope: Envelope,
    },
}

/// Commands accepted by the service.
#[derive(Debug)]
pub enum Command {
    /// Sign and broadcast a payload to all peers
    Broadcast {
        /// Message type
        message_type: MessageType,
        /// Payload
        payload: Value,
    },
    /// Sign and send a payload to one peer
    SendTo {
        /// Recipient node id
        node_id: String,
        /// Message type
        message_type: MessageType,
        /// Payload
        payload: Value,
    },
    /// Dial an address
    Connect(String),
    /// Drop a peer
    Disconnect(String),
    /// Ban an IP and drop any connection from it
    Ban {
        /// IP to ban
        ip: String,
        /// Ban duration
        duration: Duration,
    },
    /// Lift a ban
    Unban(String),
    /// Snapshot the peer table
    GetPeers(oneshot::Sender<Vec<PeerInfo>>),
    /// Stop the service
    Shutdown,
}

/// Handle for sending commands to a running [`NetworkService`].
#[derive(Clone)]
pub struct NetworkHandle {
    command_tx: mpsc::Sender<Command>,
    node_id: String,
}

impl NetworkHandle {
    /// This node's id (its address in hex).
    pub fn local_node_id(&self) -> &str {
        &self.node_id
    }

    /// Broadcasts a payload to all connected peers.
    pub async fn broadcast(&self, message_type: MessageType, payload: Value) -> Result<()> {
        self.send(Command::Broadcast {
            message_type,
            payload,
        })
        .await
    }

    /// Sends a payload to a single peer.
    pub async fn send_to(
        &self,
        node_id: String,
        message_type: MessageType,
        payload: Value,
    ) -> Result<()> {
        self.send(Command::SendTo {
            node_id,
            message_type,
            payload,
        })
        .await
    }

    /// Dials a peer address.
    pub async fn connect(&self, addr: String) -> Result<()> {
        self.send(Command::Connect(addr)).await
    }

    /// Drops a peer.
    pub async fn disconnect(&self, node_id: String) -> Result<()> {
        self.send(Command::Disconnect(node_id)).await
    }

    /// Bans an IP.
    pub async fn ban(&self, ip: String, duration: Duration) -> Result<()> {
        self.send(Command::Ban { ip, duration }).await
    }

    /// Lifts a ban.
    pub async fn unban(&self, ip: String) -> Result<()> {
        self.send(Command::Unban(ip)).await
    }

    /// Snapshot of the connected peers.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::GetPeers(tx)).await?;
        rx.await.map_err(|_| P2pError::ChannelClosed)
    }

    /// Shuts the service down.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }
}

/// Internal traffic from connection tasks into the event loop.
enum Inbound {
    Dialed(std::io::Result<TcpStream>, String),
    Frame(u64, Envelope, usize),
    Closed(u64),
}

/// A live connection, handshaked or not.
struct Conn {
    addr: SocketAddr,
    writer_tx: mpsc::Sender<Vec<u8>>,
    node_id: Option<String>,
}

struct PeerRecord {
    conn_id: u64,
    info: PeerInfo,
    last_seen: Instant,
}

/// The gossip transport service.
pub struct NetworkService {
    config: P2pConfig,
    signer: Arc<dyn Signer>,
    node_id: String,
    event_tx: mpsc::Sender<NetworkEvent>,
    command_rx: mpsc::Receiver<Command>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    conns: HashMap<u64, Conn>,
    next_conn_id: u64,
    peers: HashMap<String, PeerRecord>,
    seen: SeenNonces,
    bans: BanList,
    listen_port: u16,
    ping_seq: u64,
}

impl NetworkService {
    /// Creates a service and its command handle. Call
    /// [`NetworkService::run`] to start it.
    pub fn new(
        config: P2pConfig,
        signer: Arc<dyn Signer>,
        event_tx: mpsc::Sender<NetworkEvent>,
    ) -> (Self, NetworkHandle) {
        let node_id = signer.address().to_string();
        let (command_tx, command_rx) = mpsc::channel(1000);
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let seen = SeenNonces::new(config.seen_nonce_capacity);
        let service = Self {
            config,
            signer,
            node_id,
            event_tx,
            command_rx,
            inbound_tx,
            inbound_rx,
            conns: HashMap::new(),
            next_conn_id: 0,
            peers: HashMap::new(),
            seen,
            bans: BanList::new(),
            listen_port: 0,
            ping_seq: 0,
        };
        let handle = NetworkHandle {
            command_tx,
            node_id: service.node_id.clone(),
        };
        (service, handle)
    }

    /// This node's id (its address in hex).
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Binds the listener, dials boot nodes, and runs the event loop until
    /// shutdown.
    pub async fn run(mut self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let local = listener.local_addr()?;
        self.listen_port = local.port();
        info!(addr = %local, node_id = %self.node_id, "network service listening");
        let _ = self.event_tx.send(NetworkEvent::Listening(local)).await;

        for addr in self.config.boot_nodes.clone() {
            self.dial(addr);
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.handle_accept(stream, addr),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                Some(command) = self.command_rx.recv() => {
                    if self.handle_command(command).await {
                        info!("network service shutting down");
                        return Ok(());
                    }
                }
                Some(inbound) = self.inbound_rx.recv() => {
                    self.handle_inbound(inbound).await;
                }
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
                _ = cleanup.tick() => {
                    self.bans.cleanup();
                }
            }
        }
    }

    fn handle_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.bans.is_banned(&addr.ip().to_string()) {
            debug!(%addr, "rejecting connection from banned address");
            return;
        }
        if self.peers.len() >= self.config.max_peers {
            debug!(%addr, max = self.config.max_peers, "rejecting connection, peer cap reached");
            return;
        }
        let id = self.register_conn(stream, addr);
        trace!(conn = id, %addr, "inbound connection, awaiting handshake");
    }

    /// Splits the stream into framed reader and writer tasks and records
    /// the connection as not-yet-handshaked.
    fn register_conn(&mut self, stream: TcpStream, addr: SocketAddr) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;

        let (mut read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(256);

        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                let len = (frame.len() as u32).to_be_bytes();
                if write_half.write_all(&len).await.is_err() {
                    break;
                }
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let inbound = self.inbound_tx.clone();
        let max_frame = self.config.max_frame_bytes;
        tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 4];
                if read_half.read_exact(&mut len_buf).await.is_err() {
                    break;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len == 0 || len > max_frame {
                    warn!(conn = id, size = len, max = max_frame, "oversized frame, closing");
                    break;
                }
                let mut buf = vec![0u8; len];
                if read_half.read_exact(&mut buf).await.is_err() {
                    break;
                }
                match Envelope::decode(&buf) {
                    Ok(envelope) => {
                        if inbound.send(Inbound::Frame(id, envelope, len)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Malformed messages are dropped, not fatal.
                        warn!(conn = id, error = %e, "dropping malformed frame");
                    }
                }
            }
            let _ = inbound.send(Inbound::Closed(id)).await;
        });

        self.conns.insert(
            id,
            Conn {
                addr,
                writer_tx,
                node_id: None,
            },
        );
        id
    }

    fn dial(&self, addr: String) {
        if self.bans.is_banned(addr.split(':').next().unwrap_or("")) {
            debug!(%addr, "not dialing banned address");
            return;
        }
        let inbound = self.inbound_tx.clone();
        let timeout = self.config.connection_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
                Ok(r) => r,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connection timed out",
                )),
            };
            let _ = inbound.send(Inbound::Dialed(result, addr)).await;
        });
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Dialed(Ok(stream), addr) => {
                if self.peers.len() >= self.config.max_peers {
                    debug!(%addr, "dial completed but peer cap reached, dropping");
                    return;
                }
                match stream.peer_addr() {
                    Ok(remote) => {
                        let id = self.register_conn(stream, remote);
                        debug!(conn = id, %addr, "outbound connection, sending handshake");
                        self.send_handshake(id, MessageType::Handshake).await;
                    }
                    Err(e) => warn!(%addr, error = %e, "dialed socket unusable"),
                }
            }
            Inbound::Dialed(Err(e), addr) => {
                debug!(%addr, error = %e, "dial failed");
            }
            Inbound::Frame(id, envelope, len) => {
                self.handle_envelope(id, envelope, len).await;
            }
            Inbound::Closed(id) => {
                self.drop_conn(id).await;
            }
        }
    }

    /// Removes a connection and, if it was a handshaked peer, the peer
    /// table entry with it.
    async fn drop_conn(&mut self, id: u64) {
        let Some(conn) = self.conns.remove(&id) else {
            return;
        };
        if let Some(node_id) = conn.node_id {
            if self
                .peers
                .get(&node_id)
                .is_some_and(|record| record.conn_id == id)
            {
                self.peers.remove(&node_id);
                info!(peer = %node_id, "peer disconnected");
                let _ = self
                    .event_tx
                    .send(NetworkEvent::PeerDisconnected { node_id })
                    .await;
            }
        }
    }

    async fn handle_envelope(&mut self, conn_id: u64, envelope: Envelope, frame_len: usize) {
        let handshaked = self
            .conns
            .get(&conn_id)
            .and_then(|c| c.node_id.as_ref())
            .is_some();

        if !handshaked {
            match envelope.message_type {
                MessageType::Handshake => self.handle_handshake(conn_id, envelope, true).await,
                MessageType::HandshakeAck => self.handle_handshake(conn_id, envelope, false).await,
                other => {
                    trace!(conn = conn_id, message_type = ?other, "message before handshake, dropping");
                }
            }
            return;
        }

        let Some(sender) = self.conns.get(&conn_id).and_then(|c| c.node_id.clone()) else {
            return;
        };
        let Some(record) = self.peers.get_mut(&sender) else {
            trace!(conn = conn_id, %sender, "frame from unregistered connection, dropping");
            return;
        };
        if record.conn_id != conn_id {
            trace!(conn = conn_id, %sender, "frame from stale connection, dropping");
            return;
        }
        record.last_seen = Instant::now();
        record.info.messages_received += 1;
        record.info.bytes_received += frame_len as u64;

        // Gossip envelopes keep the originator's `from` and signature
        // across hops; everything else must come from the direct peer.
        let relayed = envelope.from != sender;
        if relayed && !envelope.message_type.is_gossip() {
            trace!(conn = conn_id, %sender, from = %envelope.from, "relayed non-gossip message, dropping");
            return;
        }

        // Bad signatures are dropped silently: invalid messages must never
        // influence consensus state. The originator's key is only known
        // when they are a direct peer; hashes and signatures inside
        // relayed payloads are checked by the consuming layer.
        if let Some(origin) = self.peers.get(&envelope.from) {
            if !envelope.verify(self.signer.as_ref(), &origin.info.public_key) {
                trace!(from = %envelope.from, message_type = ?envelope.message_type, "bad envelope signature, dropping");
                return;
            }
        }

        let from = envelope.from.clone();
        if !self.seen.insert(&envelope.nonce) {
            trace!(%from, nonce = %envelope.nonce, "duplicate nonce, dropping");
            return;
        }

        if envelope.message_type.is_gossip() {
            self.forward_gossip(&envelope, &sender).await;
        }

        match envelope.message_type {
            MessageType::Ping => {
                let reply = Envelope::new(MessageType::Pong, self.node_id.clone(), envelope.payload)
                    .directed_to(from.clone());
                self.send_envelope(&from, reply).await;
            }
            MessageType::Pong => {}
            MessageType::PeerDiscovery => {
                let peers: Vec<PeerAddr> = self
                    .peers
                    .values()
                    .filter(|r| r.info.node_id != from)
                    .map(|r| PeerAddr {
                        node_id: r.info.node_id.clone(),
                        addr: r.info.dial_addr(),
                    })
                    .collect();
                let payload = match serde_json::to_value(PeerListPayload { peers }) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to encode peer list");
                        return;
                    }
                };
                let reply = Envelope::new(MessageType::PeerList, self.node_id.clone(), payload)
                    .directed_to(from.clone());
                self.send_envelope(&from, reply).await;
            }
            MessageType::PeerList => {
                let Ok(list) = envelope.payload_as::<PeerListPayload>() else {
                    debug!(%from, "malformed peer list, dropping");
                    return;
                };
                for peer in list.peers {
                    if peer.node_id == self.node_id || self.peers.contains_key(&peer.node_id) {
                        continue;
                    }
                    if self.peers.len() >= self.config.max_peers {
                        break;
                    }
                    debug!(peer = %peer.node_id, addr = %peer.addr, "discovered peer, dialing");
                    self.dial(peer.addr);
                }
            }
            MessageType::NewBlock => {
                let _ = self
                    .event_tx
                    .send(NetworkEvent::Block {
                        from,
                        payload: envelope.payload,
                    })
                    .await;
            }
            MessageType::NewTransaction => {
                let _ = self
                    .event_tx
                    .send(NetworkEvent::Transaction {
                        from,
                        payload: envelope.payload,
                    })
                    .await;
            }
            MessageType::Vote => {
                let _ = self
                    .event_tx
                    .send(NetworkEvent::Vote {
                        from,
                        payload: envelope.payload,
                    })
                    .await;
            }
            MessageType::ConsensusMessage => {
                let _ = self
                    .event_tx
                    .send(NetworkEvent::Consensus {
                        from,
                        payload: envelope.payload,
                    })
                    .await;
            }
            MessageType::VoteRequest | MessageType::BlockRequest | MessageType::SyncRequest => {
                let _ = self
                    .event_tx
                    .send(NetworkEvent::Request { from, envelope })
                    .await;
            }
            MessageType::BlockResponse | MessageType::SyncResponse => {
                let _ = self
                    .event_tx
                    .send(NetworkEvent::Response { from, envelope })
                    .await;
            }
            MessageType::Handshake | MessageType::HandshakeAck => {
                trace!(%from, "handshake from established peer, dropping");
            }
        }
    }

    /// Validates a HANDSHAKE or HANDSHAKE_ACK and admits the peer.
    /// Mismatches are connection-level failures: log and close.
    async fn handle_handshake(&mut self, conn_id: u64, envelope: Envelope, reply: bool) {
        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        let addr = conn.addr;

        let payload = match envelope.payload_as::<HandshakePayload>() {
            Ok(p) => p,
            Err(e) => {
                warn!(conn = conn_id, %addr, error = %e, "malformed handshake, closing");
                self.drop_conn(conn_id).await;
                return;
            }
        };

        if payload.chain_id != self.config.chain_id {
            warn!(
                conn = conn_id,
                %addr,
                ours = self.config.chain_id,
                theirs = payload.chain_id,
                "chain id mismatch, closing"
            );
            self.drop_conn(conn_id).await;
            return;
        }
        if payload.network_id != self.config.network_id {
            warn!(
                conn = conn_id,
                %addr,
                ours = %self.config.network_id,
                theirs = %payload.network_id,
                "network id mismatch, closing"
            );
            self.drop_conn(conn_id).await;
            return;
        }
        if payload.node_id == self.node_id {
            debug!(conn = conn_id, "connected to self, closing");
            self.drop_conn(conn_id).await;
            return;
        }

        let Ok(public_key) = hex::decode(&payload.public_key) else {
            warn!(conn = conn_id, %addr, "undecodable public key in handshake, closing");
            self.drop_conn(conn_id).await;
            return;
        };
        if !envelope.verify(self.signer.as_ref(), &public_key) {
            // Identity claim does not verify; drop without ceremony.
            trace!(conn = conn_id, %addr, "handshake signature invalid, closing");
            self.drop_conn(conn_id).await;
            return;
        }

        if self.peers.contains_key(&payload.node_id) {
            debug!(peer = %payload.node_id, "duplicate connection, closing the new one");
            self.conns.remove(&conn_id);
            return;
        }
        if self.peers.len() >= self.config.max_peers {
            warn!(conn = conn_id, %addr, max = self.config.max_peers, "peer cap reached, closing");
            self.drop_conn(conn_id).await;
            return;
        }

        let info = PeerInfo {
            node_id: payload.node_id.clone(),
            addr,
            listen_port: payload.listen_port,
            public_key,
            capabilities: payload.capabilities,
            connected_at: valcore_types::unix_millis(),
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
        };

        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.node_id = Some(payload.node_id.clone());
        }
        self.peers.insert(
            payload.node_id.clone(),
            PeerRecord {
                conn_id,
                info: info.clone(),
                last_seen: Instant::now(),
            },
        );
        info!(peer = %payload.node_id, %addr, peers = self.peers.len(), "peer connected");

        if reply {
            self.send_handshake(conn_id, MessageType::HandshakeAck).await;
        }
        let _ = self.event_tx.send(NetworkEvent::PeerConnected(info)).await;
    }

    /// Sends our HANDSHAKE or HANDSHAKE_ACK on a connection.
    async fn send_handshake(&mut self, conn_id: u64, message_type: MessageType) {
        let payload = HandshakePayload {
            chain_id: self.config.chain_id,
            network_id: self.config.network_id.clone(),
            node_id: self.node_id.clone(),
            listen_port: self.listen_port,
            public_key: hex::encode(self.signer.public_key()),
            capabilities: self.config.capabilities.clone(),
        };
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to encode handshake");
                return;
            }
        };
        let mut envelope = Envelope::new(message_type, self.node_id.clone(), payload);
        envelope.sign(self.signer.as_ref());
        self.seen.insert(&envelope.nonce);
        self.write_to_conn(conn_id, &envelope);
    }

    /// Forwards first-seen gossip to ceil(sqrt(peerCount)) random peers,
    /// excluding the sender. Nonce is preserved so downstream dedup holds.
    async fn forward_gossip(&mut self, envelope: &Envelope, sender: &str) {
        let candidates: Vec<String> = self
            .peers
            .keys()
            .filter(|id| id.as_str() != sender && id.as_str() != envelope.from)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return;
        }
        let count = fanout_count(self.peers.len());
        // ThreadRng is !Send; sample before any await so run() stays
        // spawnable.
        let targets: Vec<String> = {
            let mut rng = rand::thread_rng();
            candidates
                .choose_multiple(&mut rng, count)
                .cloned()
                .collect()
        };
        trace!(
            message_type = ?envelope.message_type,
            targets = targets.len(),
            "forwarding gossip"
        );
        for target in targets {
            self.send_envelope(&target, envelope.clone()).await;
        }
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Broadcast {
                message_type,
                payload,
            } => {
                self.broadcast(message_type, payload).await;
            }
            Command::SendTo {
                node_id,
                message_type,
                payload,
            } => {
                let mut envelope =
                    Envelope::new(message_type, self.node_id.clone(), payload).directed_to(node_id.clone());
                envelope.sign(self.signer.as_ref());
                self.seen.insert(&envelope.nonce);
                if !self.peers.contains_key(&node_id) {
                    debug!(peer = %node_id, "send_to target not connected, dropping");
                } else {
                    self.send_envelope(&node_id, envelope).await;
                }
            }
            Command::Connect(addr) => {
                self.dial(addr);
            }
            Command::Disconnect(node_id) => {
                if let Some(record) = self.peers.get(&node_id) {
                    let conn_id = record.conn_id;
                    self.drop_conn(conn_id).await;
                }
            }
            Command::Ban { ip, duration } => {
                self.bans.ban(ip.clone(), duration);
                let doomed: Vec<u64> = self
                    .conns
                    .iter()
                    .filter(|(_, c)| c.addr.ip().to_string() == ip)
                    .map(|(id, _)| *id)
                    .collect();
                for id in doomed {
                    self.drop_conn(id).await;
                }
                info!(%ip, ?duration, "address banned");
            }
            Command::Unban(ip) => {
                self.bans.unban(&ip);
            }
            Command::GetPeers(tx) => {
                let peers: Vec<PeerInfo> =
                    self.peers.values().map(|r| r.info.clone()).collect();
                let _ = tx.send(peers);
            }
            Command::Shutdown => return true,
        }
        false
    }

    /// Signs and sends a payload to every connected peer.
    async fn broadcast(&mut self, message_type: MessageType, payload: Value) {
        let mut envelope = Envelope::new(message_type, self.node_id.clone(), payload);
        envelope.sign(self.signer.as_ref());
        // Remember our own nonce so an echo is not re-processed.
        self.seen.insert(&envelope.nonce);
        let targets: Vec<String> = self.peers.keys().cloned().collect();
        if targets.is_empty() {
            debug!(message_type = ?envelope.message_type, "broadcast with no peers, dropping");
            return;
        }
        for target in targets {
            self.send_envelope(&target, envelope.clone()).await;
        }
    }

    /// Encodes and queues an envelope for a peer, updating its counters.
    async fn send_envelope(&mut self, node_id: &str, envelope: Envelope) {
        let frame = match envelope.encode() {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to encode envelope");
                return;
            }
        };
        let Some(record) = self.peers.get_mut(node_id) else {
            return;
        };
        record.info.messages_sent += 1;
        record.info.bytes_sent += frame.len() as u64;
        let conn_id = record.conn_id;
        if let Some(conn) = self.conns.get(&conn_id) {
            // Back-pressure by dropping: a peer that cannot drain its
            // queue loses messages rather than stalling the loop.
            if conn.writer_tx.try_send(frame).is_err() {
                debug!(peer = %node_id, "writer queue full, dropping message");
            }
        }
    }

    fn write_to_conn(&mut self, conn_id: u64, envelope: &Envelope) {
        let frame = match envelope.encode() {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to encode envelope");
                return;
            }
        };
        if let Some(conn) = self.conns.get(&conn_id) {
            if conn.writer_tx.try_send(frame).is_err() {
                debug!(conn = conn_id, "writer queue full, dropping message");
            }
        }
    }

    /// Heartbeat pass: drop silent peers, ping the rest, and kick off
    /// discovery when below the minimum peer count.
    async fn heartbeat(&mut self) {
        let deadline = self.config.heartbeat_interval * 3;
        let dead: Vec<u64> = self
            .peers
            .values()
            .filter(|r| r.last_seen.elapsed() > deadline)
            .map(|r| r.conn_id)
            .collect();
        for conn_id in dead {
            warn!(conn = conn_id, "peer silent past liveness deadline, dropping");
            self.drop_conn(conn_id).await;
        }

        self.ping_seq += 1;
        let payload = match serde_json::to_value(PingPayload { seq: self.ping_seq }) {
            Ok(v) => v,
            Err(_) => return,
        };
        let targets: Vec<String> = self.peers.keys().cloned().collect();
        for target in &targets {
            let mut ping = Envelope::new(MessageType::Ping, self.node_id.clone(), payload.clone())
                .directed_to(target.clone());
            ping.sign(self.signer.as_ref());
            self.seen.insert(&ping.nonce);
            self.send_envelope(target, ping).await;
        }

        if self.peers.len() < self.config.min_peers {
            debug!(
                peers = self.peers.len(),
                min = self.config.min_peers,
                "below minimum peer count"
            );
            if self.peers.is_empty() {
                for addr in self.config.boot_nodes.clone() {
                    self.dial(addr);
                }
            } else {
                self.broadcast(MessageType::PeerDiscovery, serde_json::json!({}))
                    .await;
            }
        }
    }
}

/// Gossip fan-out: ceil(sqrt(peerCount)), bounding per-node bandwidth
/// while covering the network with high probability in O(log N) hops.
fn fanout_count(peers: usize) -> usize {
    if peers == 0 {
        return 0;
    }
    let mut k = 1usize;
    while k * k < peers {
        k += 1;
    }
    k
}
