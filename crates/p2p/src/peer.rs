//! Peer bookkeeping: per-peer counters, the bounded recently-seen nonce
//! set behind gossip deduplication, and the ban list.

use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A connected, handshaked peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    /// Peer node id
    pub node_id: String,
    /// Remote socket address of the live connection
    pub addr: SocketAddr,
    /// Port the peer accepts inbound connections on
    pub listen_port: u16,
    /// Peer public key
    pub public_key: Vec<u8>,
    /// Protocol capabilities declared at handshake
    pub capabilities: Vec<String>,
    /// Milliseconds since the Unix epoch at handshake completion
    pub connected_at: u64,
    /// Messages sent to this peer
    pub messages_sent: u64,
    /// Messages received from this peer
    pub messages_received: u64,
    /// Bytes sent to this peer
    pub bytes_sent: u64,
    /// Bytes received from this peer
    pub bytes_received: u64,
}

impl PeerInfo {
    /// The address this peer accepts dials on.
    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.addr.ip(), self.listen_port)
    }
}

/// Bounded set of recently-seen envelope nonces.
///
/// Insertion order is tracked so the oldest entries are evicted once the
/// capacity is exceeded, keeping memory bounded under sustained gossip.
#[derive(Debug)]
pub struct SeenNonces {
    capacity: usize,
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenNonces {
    /// Creates a set holding at most `capacity` nonces.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            set: HashSet::with_capacity(capacity.max(1)),
            order: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Records a nonce. Returns `true` if it was first-seen, `false` if it
    /// was already known (a gossip duplicate).
    pub fn insert(&mut self, nonce: &str) -> bool {
        if self.set.contains(nonce) {
            return false;
        }
        while self.set.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            } else {
                break;
            }
        }
        self.set.insert(nonce.to_string());
        self.order.push_back(nonce.to_string());
        true
    }

    /// Number of nonces currently retained.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether no nonces are retained.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Banned addresses with expiry, keyed by IP.
#[derive(Debug, Default)]
pub struct BanList {
    bans: HashMap<String, Instant>,
}

impl BanList {
    /// Creates an empty ban list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bans an IP for the given duration, extending any existing ban.
    pub fn ban(&mut self, ip: String, duration: Duration) {
        let until = Instant::now() + duration;
        let entry = self.bans.entry(ip).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    /// Lifts a ban.
    pub fn unban(&mut self, ip: &str) {
        self.bans.remove(ip);
    }

    /// Whether the IP is currently banned.
    pub fn is_banned(&self, ip: &str) -> bool {
        self.bans.get(ip).is_some_and(|until| *until > Instant::now())
    }

    /// Drops expired bans.
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        self.bans.retain(|_, until| *until > now);
    }

    /// Number of entries, including not-yet-cleaned expired ones.
    pub fn len(&self) -> usize {
        self.bans.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}
