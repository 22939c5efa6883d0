//! Peer sessions.
//!
//! A `Session` owns one TCP connection to a remote peer: it performs the
//! Hello handshake, multiplexes the built-in control packets with
//! registered capabilities, and applies the peer-exchange policy. One
//! cooperative task per session drives the read loop; writes are serialised
//! through the egress queue. Every spawned task holds an `Arc` to the
//! session, so the session outlives all of its in-flight I/O.

mod egress;
mod exchange;
mod handlers;
mod ingress;

use crate::capability::{Capability, CapabilityInfo, RegisteredCapability};
use crate::frame;
use crate::host::Host;
use crate::identity::NodeId;
use crate::node::{Endpoint, KnownNodes, NodeRecord, Origin};
use crate::protocol::{bare_packet, disconnect_packet, DisconnectReason, PacketType};
use egress::Egress;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Monotonic source of session identifiers for logging and `PeerInfo`.
static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// PeerInfo
// ============================================================================

/// Read-only snapshot of a session, exposed to observers.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Remote identity (null until the handshake completes).
    pub id: NodeId,
    /// Remote client version string.
    pub client_version: String,
    /// Remote host address as text.
    pub host: String,
    /// Remote advertised listen port.
    pub port: u16,
    /// Last measured round-trip latency.
    pub last_ping: Option<Duration>,
    /// Capabilities the remote advertised.
    pub caps: Vec<CapabilityInfo>,
    /// Local connection handle.
    pub socket_id: u64,
    /// Free-form notes (traffic counters, uptime).
    pub notes: HashMap<String, String>,
}

// ============================================================================
// Session State
// ============================================================================

/// Mutable session state, guarded by one lock. Handlers run on the read
/// task and hold the lock only for short, non-awaiting sections.
struct SessionState {
    /// Node record, set once the remote's identity is validated.
    node: Option<Arc<NodeRecord>>,
    /// Remote protocol version from Hello.
    protocol_version: u64,
    /// Remote client version from Hello.
    client_version: String,
    /// Remote advertised listen port from Hello.
    listen_port: u16,
    /// Capabilities the remote advertised.
    caps: Vec<CapabilityInfo>,
    /// Node indices the remote is known to already know.
    known_nodes: KnownNodes,
    /// When the last Ping was sent.
    ping_at: Option<Instant>,
    /// Last measured round-trip latency.
    last_ping: Option<Duration>,
    /// When a local disconnect was initiated. `None` means never.
    disconnect_at: Option<Instant>,
}

/// Per-session traffic counters.
#[derive(Debug, Default)]
struct SessionStats {
    packets_sent: AtomicU64,
    packets_recv: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
}

impl SessionStats {
    fn note_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn note_recv_bytes(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn note_recv_packet(&self) {
        self.packets_recv.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Session
// ============================================================================

/// One live connection to a remote peer.
pub struct Session {
    /// Self-handle for spawning tasks that must keep the session alive.
    weak_self: Weak<Session>,
    /// Host handle, kept alive externally for the session's lifetime.
    host: Weak<dyn Host>,
    /// Local connection handle for logs and `PeerInfo`.
    socket_id: u64,
    /// Dial address (outbound) or accept-time remote address (inbound);
    /// the fallback before the remote's identity is known.
    manual_endpoint: Endpoint,
    /// Actual remote socket address.
    remote_addr: SocketAddr,
    /// Accept a different-than-expected remote identity.
    force_identity: bool,
    /// When the connection was established.
    connect_at: Instant,
    /// Set once `start` has run.
    started: AtomicBool,
    /// Set once the socket is closed; closing is idempotent.
    closed: AtomicBool,
    /// Wakes the read loop when the session is dropped mid-read.
    shutdown: Notify,
    /// Read half, taken by the read loop at startup.
    reader: Mutex<Option<OwnedReadHalf>>,
    /// Serialised write queue.
    egress: Egress,
    /// Mutable session state.
    state: Mutex<SessionState>,
    /// Capability handlers bound to this session.
    capabilities: Mutex<Vec<RegisteredCapability>>,
    /// Traffic counters.
    stats: SessionStats,
}

impl Session {
    /// Create a session whose remote identity is not yet known: an
    /// accepted inbound connection, or an outbound dial to a bare address.
    pub fn new(
        host: &Arc<dyn Host>,
        stream: TcpStream,
        manual_endpoint: Endpoint,
    ) -> io::Result<Arc<Self>> {
        Self::build(host, stream, manual_endpoint, None, false)
    }

    /// Create an outbound session dialled to a node with a known identity.
    ///
    /// With `force_identity` set, a remote that turns out to hold a
    /// different identity is accepted instead of disconnected.
    pub fn with_node(
        host: &Arc<dyn Host>,
        stream: TcpStream,
        node: Arc<NodeRecord>,
        force_identity: bool,
    ) -> io::Result<Arc<Self>> {
        let manual_endpoint = node.endpoint();
        Self::build(host, stream, manual_endpoint, Some(node), force_identity)
    }

    fn build(
        host: &Arc<dyn Host>,
        stream: TcpStream,
        manual_endpoint: Endpoint,
        node: Option<Arc<NodeRecord>>,
        force_identity: bool,
    ) -> io::Result<Arc<Self>> {
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let socket_id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);

        Ok(Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            host: Arc::downgrade(host),
            socket_id,
            manual_endpoint,
            remote_addr,
            force_identity,
            connect_at: Instant::now(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            reader: Mutex::new(Some(reader)),
            egress: Egress::new(writer),
            state: Mutex::new(SessionState {
                node,
                protocol_version: 0,
                client_version: String::from("?"),
                listen_port: manual_endpoint.port,
                caps: Vec::new(),
                known_nodes: KnownNodes::new(),
                ping_at: None,
                last_ping: None,
                disconnect_at: None,
            }),
            capabilities: Mutex::new(Vec::new()),
            stats: SessionStats::default(),
        }))
    }

    // === Public Surface ===

    /// Send our Hello, probe the peer, and begin the read loop.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(host) = self.host() else {
            return;
        };
        let Some(session) = self.weak_self.upgrade() else {
            return;
        };

        let hello = crate::protocol::Hello {
            protocol_version: host.protocol_version(),
            client_version: host.client_version(),
            caps: host.capabilities(),
            listen_port: host.listen_port(),
            id: host.id(),
        };
        self.seal_and_send(hello.to_item());
        self.ping();
        self.get_peers();

        tokio::spawn(session.read_loop());
    }

    /// Send a Ping and arm the round-trip clock.
    pub fn ping(&self) {
        self.seal_and_send(bare_packet(PacketType::Ping));
        self.state.lock().expect("state lock poisoned").ping_at = Some(Instant::now());
    }

    /// Ask the remote for peers it knows.
    pub fn get_peers(&self) {
        self.seal_and_send(bare_packet(PacketType::GetPeers));
    }

    /// Initiate a disconnect.
    ///
    /// The first call sends a Disconnect packet (queued behind any pending
    /// writes) and records the time; a second call forces the socket
    /// closed without waiting for the flush.
    pub fn disconnect(&self, reason: DisconnectReason) {
        info!(session = self.socket_id, reason = %reason, "disconnecting");

        let node = self.state.lock().expect("state lock poisoned").node.clone();
        if let Some(node) = node {
            node.note_disconnect(reason);
        }

        if self.is_closed() {
            return;
        }

        let already_pending = {
            let mut state = self.state.lock().expect("state lock poisoned");
            match state.disconnect_at {
                Some(_) => true,
                None => {
                    state.disconnect_at = Some(Instant::now());
                    false
                }
            }
        };

        if already_pending {
            self.dropped();
        } else {
            self.seal_and_send(disconnect_packet(reason));
        }
    }

    /// Enqueue an already-sealed packet.
    ///
    /// A buffer that fails frame validation is a programming error on the
    /// caller's side; it is logged and sent regardless.
    pub fn send(&self, packet: Vec<u8>) {
        if !frame::validate(&packet) {
            warn!(session = self.socket_id, "invalid packet constructed");
        }
        self.enqueue(packet);
    }

    /// The remote's identity, null until the handshake completes.
    pub fn id(&self) -> NodeId {
        self.state
            .lock()
            .expect("state lock poisoned")
            .node
            .as_ref()
            .map(|node| node.id())
            .unwrap_or_default()
    }

    /// The best-known remote endpoint: the live socket address with the
    /// advertised listen port while connected, the node record after, and
    /// the manual endpoint before identity is known.
    pub fn endpoint(&self) -> Endpoint {
        let state = self.state.lock().expect("state lock poisoned");
        match &state.node {
            Some(node) if !self.is_closed() => {
                Endpoint::new(self.remote_addr.ip(), node.endpoint().port)
            }
            Some(node) => node.endpoint(),
            None => self.manual_endpoint,
        }
    }

    /// The remote's short-term rating.
    pub fn rating(&self) -> u64 {
        self.state
            .lock()
            .expect("state lock poisoned")
            .node
            .as_ref()
            .map(|node| node.rating())
            .unwrap_or(0)
    }

    /// Reward the remote; accumulates both rating and score.
    pub fn add_rating(&self, delta: u64) {
        if let Some(node) = &self.state.lock().expect("state lock poisoned").node {
            node.add_rating(delta);
        }
    }

    /// Snapshot of this session for observers.
    pub fn peer_info(&self) -> PeerInfo {
        let state = self.state.lock().expect("state lock poisoned");
        let mut notes = HashMap::new();
        notes.insert(
            "packets_sent".into(),
            self.stats.packets_sent.load(Ordering::Relaxed).to_string(),
        );
        notes.insert(
            "packets_recv".into(),
            self.stats.packets_recv.load(Ordering::Relaxed).to_string(),
        );
        notes.insert(
            "bytes_sent".into(),
            self.stats.bytes_sent.load(Ordering::Relaxed).to_string(),
        );
        notes.insert(
            "bytes_recv".into(),
            self.stats.bytes_recv.load(Ordering::Relaxed).to_string(),
        );
        notes.insert(
            "connected_secs".into(),
            self.connect_at.elapsed().as_secs().to_string(),
        );

        PeerInfo {
            id: state.node.as_ref().map(|n| n.id()).unwrap_or_default(),
            client_version: state.client_version.clone(),
            host: self.remote_addr.ip().to_string(),
            port: state.listen_port,
            last_ping: state.last_ping,
            caps: state.caps.clone(),
            socket_id: self.socket_id,
            notes,
        }
    }

    /// Whether the socket has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bind a capability handler to this session, assigning it the next
    /// free packet-id range.
    pub fn register_capability(&self, info: CapabilityInfo, handler: Box<dyn Capability>) {
        let mut caps = self.capabilities.lock().expect("capability lock poisoned");
        let mut id_offset = crate::protocol::FIRST_CAPABILITY_PACKET;
        for cap in caps.iter() {
            id_offset = match id_offset.checked_add(cap.handler.message_count()) {
                Some(offset) => offset,
                None => {
                    warn!(session = self.socket_id, cap = %info, "packet id space exhausted");
                    return;
                }
            };
        }
        debug!(session = self.socket_id, cap = %info, id_offset, "capability registered");
        caps.push(RegisteredCapability {
            info,
            id_offset,
            enabled: true,
            handler,
        });
    }

    // === Internal Helpers ===

    /// Upgrade the host handle; a session whose host is gone can only shut
    /// down.
    pub(crate) fn host(&self) -> Option<Arc<dyn Host>> {
        self.host.upgrade()
    }

    pub(crate) fn socket_id(&self) -> u64 {
        self.socket_id
    }

    /// Whether a local disconnect has been initiated.
    fn disconnecting(&self) -> bool {
        self.state
            .lock()
            .expect("state lock poisoned")
            .disconnect_at
            .is_some()
    }

    /// Seal a structural payload into a frame and enqueue it.
    pub(crate) fn seal_and_send(&self, payload: crate::codec::Item) {
        let Some(host) = self.host() else {
            return;
        };
        let mut packet = vec![0u8; frame::HEADER_SIZE];
        payload.encode_into(&mut packet);
        host.seal(&mut packet);
        self.send(packet);
    }

    /// Close the socket without sending a Disconnect. Idempotent; wakes
    /// the read loop and releases the write half.
    pub(crate) fn dropped(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session = self.socket_id, remote = %self.remote_addr, "closing connection");
        self.shutdown.notify_one();
        self.egress.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Best-effort: remember the node with its trust reset so the host
        // can retry it later.
        let id = self
            .state
            .lock()
            .ok()
            .and_then(|state| state.node.as_ref().map(|node| node.id()));
        if let (Some(id), Some(host)) = (id, self.host.upgrade()) {
            host.note_node(id, self.manual_endpoint, Origin::Unknown, true, None);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("socket_id", &self.socket_id)
            .field("remote", &self.remote_addr)
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
