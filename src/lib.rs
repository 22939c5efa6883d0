//! Wyre: peer session layer for a blockchain node's P2P stack.
//!
//! A `Session` owns one TCP connection to a remote peer: framed transport,
//! Hello handshake, control packets, capability multiplexing, and the
//! peer-exchange policy that decides which gossiped addresses enter the
//! host's peer set. The rest of the node plugs in through the `Host` trait.

pub mod capability;
pub mod codec;
pub mod config;
pub mod frame;
pub mod host;
pub mod identity;
pub mod node;
pub mod protocol;
pub mod session;

// Re-export identity types
pub use identity::{IdentityError, NodeId};

// Re-export config types
pub use config::{Config, ConfigError, IdentityConfig, NetConfig, PeerEntry};

// Re-export codec types
pub use codec::{CodecError, Item};

// Re-export node types
pub use node::{Endpoint, KnownNodes, NodeRecord, Origin};

// Re-export protocol types
pub use protocol::{
    DisconnectReason, Hello, PacketType, PeerAdvert, ProtocolError, FIRST_CAPABILITY_PACKET,
    PROTOCOL_VERSION,
};

// Re-export capability types
pub use capability::{Capability, CapabilityInfo};

// Re-export host types
pub use host::{CapabilityFactory, Host, MemoryHost, NetworkPolicy, PeerCandidate};

// Re-export session types
pub use session::{PeerInfo, Session};
