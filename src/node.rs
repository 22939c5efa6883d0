//! Node records and peer bookkeeping.
//!
//! A `NodeRecord` is the host-side entry for a remote node: identity,
//! last-known endpoint, how we learned about it, and its accumulated
//! rating. Sessions share records with the host through `Arc` and mutate
//! them only through the record's own methods.

use crate::identity::NodeId;
use crate::protocol::DisconnectReason;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI16, AtomicU64, Ordering};
use std::sync::Mutex;

// ============================================================================
// Endpoint
// ============================================================================

/// A remote node's advertised TCP endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from address and port.
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Whether the address is private, loopback, or link-local.
    ///
    /// Peer-exchange policy refuses to gossip such addresses unless the
    /// host explicitly allows local networking.
    pub fn is_private(&self) -> bool {
        match self.addr {
            IpAddr::V4(v4) => {
                v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
            }
            IpAddr::V6(v6) => {
                let seg = v6.segments();
                v6.is_loopback()
                    || v6.is_unspecified()
                    || (seg[0] & 0xfe00) == 0xfc00 // unique local fc00::/7
                    || (seg[0] & 0xffc0) == 0xfe80 // link local fe80::/10
            }
        }
    }

    /// The raw address bytes as carried in peer advertisements:
    /// 4 bytes for IPv4, 16 for IPv6.
    pub fn address_bytes(&self) -> Vec<u8> {
        match self.addr {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    /// The corresponding socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

// ============================================================================
// Origin
// ============================================================================

/// How much we trust our knowledge of a node's identity, in increasing
/// order. The ordering drives the identity-change policy: a record of
/// stronger origin is not silently replaced by a weaker one.
///
/// `Direct` marks identities learned from the node itself over a live
/// connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Origin {
    /// Nothing known beyond an address.
    Unknown = 0,
    /// Relayed by a directly-contacted peer.
    SelfThird = 1,
    /// Relayed by a fully-trusted peer.
    PerfectThird = 2,
    /// Learned from the node itself.
    Direct = 3,
    /// Pinned by the operator.
    Perfect = 4,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Origin::Unknown => "unknown",
            Origin::SelfThird => "self-third",
            Origin::PerfectThird => "perfect-third",
            Origin::Direct => "direct",
            Origin::Perfect => "perfect",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// NodeRecord
// ============================================================================

/// Sentinel for "no disconnect recorded" in the atomic slot.
const NO_DISCONNECT: i16 = -1;

/// A host-side record for one known node.
///
/// Shared between the host's table and any session talking to the node.
/// `rating` is the short-term score a session accumulates; `score` is the
/// long-term aggregate. Both only grow.
#[derive(Debug)]
pub struct NodeRecord {
    id: NodeId,
    index: usize,
    endpoint: Mutex<Endpoint>,
    origin: Mutex<Origin>,
    rating: AtomicU64,
    score: AtomicU64,
    last_disconnect: AtomicI16,
}

impl NodeRecord {
    /// Create a record. `index` is the host-assigned slot used by
    /// known-nodes bitsets.
    pub fn new(id: NodeId, index: usize, endpoint: Endpoint, origin: Origin) -> Self {
        Self {
            id,
            index,
            endpoint: Mutex::new(endpoint),
            origin: Mutex::new(origin),
            rating: AtomicU64::new(0),
            score: AtomicU64::new(0),
            last_disconnect: AtomicI16::new(NO_DISCONNECT),
        }
    }

    /// The node's identity.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The host-assigned index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Last-known endpoint.
    pub fn endpoint(&self) -> Endpoint {
        *self.endpoint.lock().expect("endpoint lock poisoned")
    }

    /// Replace the endpoint (used by the lazy public-address learn in the
    /// peer-exchange policy).
    pub fn set_endpoint(&self, endpoint: Endpoint) {
        *self.endpoint.lock().expect("endpoint lock poisoned") = endpoint;
    }

    /// Current identity origin.
    pub fn origin(&self) -> Origin {
        *self.origin.lock().expect("origin lock poisoned")
    }

    /// Raise the origin. Weaker origins never overwrite stronger ones.
    pub fn raise_origin(&self, origin: Origin) {
        let mut current = self.origin.lock().expect("origin lock poisoned");
        if origin > *current {
            *current = origin;
        }
    }

    /// Short-term rating.
    pub fn rating(&self) -> u64 {
        self.rating.load(Ordering::Relaxed)
    }

    /// Long-term score.
    pub fn score(&self) -> u64 {
        self.score.load(Ordering::Relaxed)
    }

    /// Add to both rating and score.
    pub fn add_rating(&self, delta: u64) {
        self.rating.fetch_add(delta, Ordering::Relaxed);
        self.score.fetch_add(delta, Ordering::Relaxed);
    }

    /// Record the reason of the most recent disconnect.
    pub fn note_disconnect(&self, reason: DisconnectReason) {
        self.last_disconnect
            .store(reason.to_byte() as i16, Ordering::Relaxed);
    }

    /// Clear the disconnect marker (called when a handshake completes, so
    /// host back-off policy resets).
    pub fn clear_disconnect(&self) {
        self.last_disconnect.store(NO_DISCONNECT, Ordering::Relaxed);
    }

    /// The most recent disconnect reason, if any.
    pub fn last_disconnect(&self) -> Option<DisconnectReason> {
        match self.last_disconnect.load(Ordering::Relaxed) {
            NO_DISCONNECT => None,
            value => DisconnectReason::from_byte(value as u8),
        }
    }
}

// ============================================================================
// KnownNodes
// ============================================================================

/// Per-session set of node indices the remote is known to already know.
///
/// Seeded when the remote's own record is learned and grown with every
/// advertisement we forward, so peer exchange never re-sends a node.
#[derive(Clone, Debug, Default)]
pub struct KnownNodes {
    words: Vec<u64>,
}

impl KnownNodes {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a node index as known.
    pub fn mark(&mut self, index: usize) {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % 64);
    }

    /// Whether a node index is marked.
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1 << (index % 64)) != 0)
    }

    /// Number of marked indices.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether no index is marked.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}
