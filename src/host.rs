//! Host interface.
//!
//! A session talks to the rest of the node exclusively through the `Host`
//! trait: identity and capability advertisement for the handshake, the node
//! table for peer exchange, the session registry for duplicate suppression,
//! and the seal step for outgoing frames.
//!
//! `MemoryHost` is a minimal in-memory implementation used by the daemon
//! and the test suite. A full node supplies its own host with persistent
//! peer storage and scoring.

use crate::capability::{Capability, CapabilityInfo};
use crate::frame;
use crate::identity::NodeId;
use crate::node::{Endpoint, KnownNodes, NodeRecord, Origin};
use crate::session::Session;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

// ============================================================================
// Policy
// ============================================================================

/// Host-wide peer-management policy knobs.
#[derive(Clone, Copy, Debug)]
pub struct NetworkPolicy {
    /// Accept and gossip private (RFC1918, loopback, link-local)
    /// addresses. Off for internet-facing nodes.
    pub local_networking: bool,

    /// Treat the first identity seen at an `address:port` as authoritative
    /// and drop later claimants. This mirrors the historical behaviour and
    /// is an acknowledged poisoning vector; disabling it admits competing
    /// claims instead.
    pub pin_first_address: bool,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            local_networking: false,
            pin_first_address: true,
        }
    }
}

// ============================================================================
// Host Trait
// ============================================================================

/// A peer candidate offered to the peer-exchange policy.
#[derive(Clone, Debug)]
pub struct PeerCandidate {
    pub id: NodeId,
    pub endpoint: Endpoint,
    /// Host-assigned node index, as used in known-nodes bitsets.
    pub index: usize,
}

/// The node-side surface a session depends on.
///
/// Sessions hold their host weakly and upgrade at each use; the host's
/// session registry in turn must not keep sessions alive beyond their
/// read task.
pub trait Host: Send + Sync {
    /// Our own identity.
    fn id(&self) -> NodeId;

    /// Protocol version we speak; sessions require an exact match.
    fn protocol_version(&self) -> u64;

    /// Client version string advertised in Hello.
    fn client_version(&self) -> String;

    /// TCP port we accept connections on.
    fn listen_port(&self) -> u16;

    /// Capabilities we support.
    fn capabilities(&self) -> Vec<CapabilityInfo>;

    /// Addresses this host considers its own; peer exchange refuses
    /// advertisements pointing back at them.
    fn local_addresses(&self) -> Vec<IpAddr>;

    /// Peer-management policy.
    fn policy(&self) -> NetworkPolicy;

    /// Whether a live session to this identity already exists.
    fn have_peer(&self, id: &NodeId) -> bool;

    /// Insert or update a node record.
    ///
    /// `pending` marks records we have not yet completed a handshake with.
    /// `replaces` hints that the identity previously recorded under that id
    /// turned out to be wrong and should be retired.
    fn note_node(
        &self,
        id: NodeId,
        endpoint: Endpoint,
        origin: Origin,
        pending: bool,
        replaces: Option<NodeId>,
    ) -> Arc<NodeRecord>;

    /// Look up an existing node record.
    fn node_record(&self, id: &NodeId) -> Option<Arc<NodeRecord>>;

    /// Whether any known node already claims this exact endpoint.
    fn endpoint_in_use(&self, endpoint: &Endpoint) -> bool;

    /// Candidate peers for a Peers reply, excluding indices the remote
    /// already knows.
    fn potential_peers(&self, known: &KnownNodes) -> Vec<PeerCandidate>;

    /// Register a session that completed its handshake and instantiate
    /// capability handlers for the capabilities both sides support.
    fn register_session(&self, session: &Arc<Session>, caps: &[CapabilityInfo]);

    /// Fill the frame header of an outgoing packet in place.
    ///
    /// Delegated to the host so a future framing scheme can replace it
    /// without touching the session.
    fn seal(&self, packet: &mut Vec<u8>) {
        frame::seal(packet);
    }
}

// ============================================================================
// MemoryHost
// ============================================================================

/// Factory producing a fresh capability handler for one session.
pub type CapabilityFactory = Box<dyn Fn() -> Box<dyn Capability> + Send + Sync>;

struct NodeTable {
    by_id: HashMap<NodeId, Arc<NodeRecord>>,
    next_index: usize,
}

/// In-memory host: node table, weak session registry, capability
/// factories. Suitable for the daemon and for tests; keeps nothing across
/// restarts.
pub struct MemoryHost {
    id: NodeId,
    protocol_version: u64,
    client_version: String,
    listen_port: u16,
    policy: NetworkPolicy,
    local_addresses: Vec<IpAddr>,
    caps: Mutex<Vec<(CapabilityInfo, CapabilityFactory)>>,
    nodes: Mutex<NodeTable>,
    sessions: Mutex<HashMap<NodeId, Weak<Session>>>,
}

impl MemoryHost {
    /// Create a host with default policy and client version.
    pub fn new(id: NodeId, listen_port: u16) -> Self {
        Self {
            id,
            protocol_version: crate::protocol::PROTOCOL_VERSION,
            client_version: format!("wyre/{}", env!("CARGO_PKG_VERSION")),
            listen_port,
            policy: NetworkPolicy::default(),
            local_addresses: Vec::new(),
            caps: Mutex::new(Vec::new()),
            nodes: Mutex::new(NodeTable {
                by_id: HashMap::new(),
                next_index: 0,
            }),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Override the client version string.
    pub fn with_client_version(mut self, client_version: impl Into<String>) -> Self {
        self.client_version = client_version.into();
        self
    }

    /// Override the policy.
    pub fn with_policy(mut self, policy: NetworkPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Add an address this host considers its own.
    pub fn with_local_address(mut self, addr: IpAddr) -> Self {
        self.local_addresses.push(addr);
        self
    }

    /// Register a supported capability with a per-session handler factory.
    pub fn add_capability(&self, info: CapabilityInfo, factory: CapabilityFactory) {
        self.caps
            .lock()
            .expect("caps lock poisoned")
            .push((info, factory));
    }

    /// Number of known nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.lock().expect("nodes lock poisoned").by_id.len()
    }

    /// Number of live registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .values()
            .filter(|s| s.upgrade().is_some_and(|s| !s.is_closed()))
            .count()
    }
}

impl Host for MemoryHost {
    fn id(&self) -> NodeId {
        self.id
    }

    fn protocol_version(&self) -> u64 {
        self.protocol_version
    }

    fn client_version(&self) -> String {
        self.client_version.clone()
    }

    fn listen_port(&self) -> u16 {
        self.listen_port
    }

    fn capabilities(&self) -> Vec<CapabilityInfo> {
        self.caps
            .lock()
            .expect("caps lock poisoned")
            .iter()
            .map(|(info, _)| info.clone())
            .collect()
    }

    fn local_addresses(&self) -> Vec<IpAddr> {
        self.local_addresses.clone()
    }

    fn policy(&self) -> NetworkPolicy {
        self.policy
    }

    fn have_peer(&self, id: &NodeId) -> bool {
        let mut sessions = self.sessions.lock().expect("sessions lock poisoned");
        match sessions.get(id).and_then(Weak::upgrade) {
            Some(session) => !session.is_closed(),
            None => {
                sessions.remove(id);
                false
            }
        }
    }

    fn note_node(
        &self,
        id: NodeId,
        endpoint: Endpoint,
        origin: Origin,
        _pending: bool,
        replaces: Option<NodeId>,
    ) -> Arc<NodeRecord> {
        let mut nodes = self.nodes.lock().expect("nodes lock poisoned");

        if let Some(stale) = replaces {
            if stale != id && nodes.by_id.remove(&stale).is_some() {
                debug!(stale = %stale.short(), id = %id.short(), "retired stale node record");
            }
        }

        if let Some(record) = nodes.by_id.get(&id) {
            // Stronger knowledge updates the address; origin only rises.
            if origin >= record.origin() {
                record.set_endpoint(endpoint);
            }
            record.raise_origin(origin);
            return Arc::clone(record);
        }

        let index = nodes.next_index;
        nodes.next_index += 1;
        let record = Arc::new(NodeRecord::new(id, index, endpoint, origin));
        nodes.by_id.insert(id, Arc::clone(&record));
        debug!(id = %id.short(), endpoint = %endpoint, origin = %origin, index, "new node record");
        record
    }

    fn node_record(&self, id: &NodeId) -> Option<Arc<NodeRecord>> {
        self.nodes
            .lock()
            .expect("nodes lock poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    fn endpoint_in_use(&self, endpoint: &Endpoint) -> bool {
        self.nodes
            .lock()
            .expect("nodes lock poisoned")
            .by_id
            .values()
            .any(|record| record.endpoint() == *endpoint)
    }

    fn potential_peers(&self, known: &KnownNodes) -> Vec<PeerCandidate> {
        self.nodes
            .lock()
            .expect("nodes lock poisoned")
            .by_id
            .values()
            .filter(|record| !known.contains(record.index()))
            .map(|record| PeerCandidate {
                id: record.id(),
                endpoint: record.endpoint(),
                index: record.index(),
            })
            .collect()
    }

    fn register_session(&self, session: &Arc<Session>, caps: &[CapabilityInfo]) {
        let id = session.id();
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .insert(id, Arc::downgrade(session));

        let factories = self.caps.lock().expect("caps lock poisoned");
        for (info, factory) in factories.iter() {
            if caps.contains(info) {
                session.register_capability(info.clone(), factory());
            }
        }
    }
}
