//! Protocol messages.
//!
//! The built-in control packets every session speaks: the handshake Hello,
//! Disconnect, Ping/Pong, and the peer-exchange pair GetPeers/Peers. Packet
//! ids above the built-in range belong to capabilities.
//!
//! A packet is a structural list whose first element is the packet type:
//!
//! | Id   | Packet     | Body                                              |
//! |------|------------|---------------------------------------------------|
//! | 0x00 | Hello      | version, client, capabilities, listen port, id    |
//! | 0x01 | Disconnect | reason code                                       |
//! | 0x02 | Ping       | -                                                 |
//! | 0x03 | Pong       | -                                                 |
//! | 0x04 | GetPeers   | -                                                 |
//! | 0x05 | Peers      | one `[address, port, id]` entry per advertisement |

use crate::capability::CapabilityInfo;
use crate::codec::{CodecError, Item};
use crate::identity::NodeId;
use crate::node::Endpoint;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Protocol version spoken by this implementation. Hello carries it and
/// sessions require an exact match.
pub const PROTOCOL_VERSION: u64 = 2;

/// Lowest packet id handed to capabilities; ids below are built-in.
pub const FIRST_CAPABILITY_PACKET: u8 = 0x10;

/// Most peers advertised in a single Peers reply.
pub const MAX_PEERS_PER_REPLY: usize = 10;

/// Errors related to protocol message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("peer address must be 4 or 16 bytes, got {0}")]
    AddressLength(usize),

    #[error("field out of range: {0}")]
    FieldRange(&'static str),
}

// ============================================================================
// Packet Types
// ============================================================================

/// Built-in packet type identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Hello = 0x00,
    Disconnect = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    GetPeers = 0x04,
    Peers = 0x05,
}

impl PacketType {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(PacketType::Hello),
            0x01 => Some(PacketType::Disconnect),
            0x02 => Some(PacketType::Ping),
            0x03 => Some(PacketType::Pong),
            0x04 => Some(PacketType::GetPeers),
            0x05 => Some(PacketType::Peers),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Hello => "Hello",
            PacketType::Disconnect => "Disconnect",
            PacketType::Ping => "Ping",
            PacketType::Pong => "Pong",
            PacketType::GetPeers => "GetPeers",
            PacketType::Peers => "Peers",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Disconnect Reasons
// ============================================================================

/// Reason codes carried in Disconnect packets. The numeric assignment is
/// part of the wire protocol and must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Orderly disconnect requested by the application.
    Requested = 0x00,
    /// Underlying transport failed.
    TcpError = 0x01,
    /// Framing or payload corruption.
    BadProtocol = 0x02,
    /// Peer offers nothing we need.
    UselessPeer = 0x03,
    /// Connection limit reached.
    TooManyPeers = 0x04,
    /// Already connected to this identity.
    DuplicatePeer = 0x05,
    /// Protocol version mismatch.
    IncompatibleProtocol = 0x06,
    /// Peer advertised the null identity.
    NullIdentity = 0x07,
    /// Client shutting down.
    ClientQuit = 0x08,
    /// Identity differs from the one we dialled.
    UnexpectedIdentity = 0x09,
}

impl DisconnectReason {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(DisconnectReason::Requested),
            0x01 => Some(DisconnectReason::TcpError),
            0x02 => Some(DisconnectReason::BadProtocol),
            0x03 => Some(DisconnectReason::UselessPeer),
            0x04 => Some(DisconnectReason::TooManyPeers),
            0x05 => Some(DisconnectReason::DuplicatePeer),
            0x06 => Some(DisconnectReason::IncompatibleProtocol),
            0x07 => Some(DisconnectReason::NullIdentity),
            0x08 => Some(DisconnectReason::ClientQuit),
            0x09 => Some(DisconnectReason::UnexpectedIdentity),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::Requested => "disconnect requested",
            DisconnectReason::TcpError => "TCP error",
            DisconnectReason::BadProtocol => "bad protocol",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::DuplicatePeer => "duplicate peer",
            DisconnectReason::IncompatibleProtocol => "incompatible protocol",
            DisconnectReason::NullIdentity => "null identity",
            DisconnectReason::ClientQuit => "client quit",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Hello
// ============================================================================

/// The handshake packet, sent by both sides when a session starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u64,
    pub client_version: String,
    pub caps: Vec<CapabilityInfo>,
    pub listen_port: u16,
    pub id: NodeId,
}

impl Hello {
    /// Encode as a full packet payload.
    pub fn to_item(&self) -> Item {
        Item::list(vec![
            Item::uint(PacketType::Hello.to_byte() as u64),
            Item::uint(self.protocol_version),
            Item::str(&self.client_version),
            Item::list(self.caps.iter().map(CapabilityInfo::to_item).collect()),
            Item::uint(self.listen_port as u64),
            Item::bytes(self.id.as_bytes().to_vec()),
        ])
    }

    /// Decode from a full packet payload (first element is the type).
    pub fn from_item(item: &Item) -> Result<Self, ProtocolError> {
        let protocol_version = item.at(1)?.as_uint()?;
        let client_version = item.at(2)?.as_str()?.to_string();
        let caps = item
            .at(3)?
            .as_list()?
            .iter()
            .map(CapabilityInfo::from_item)
            .collect::<Result<Vec<_>, _>>()?;
        let listen_port = u16::try_from(item.at(4)?.as_uint()?)
            .map_err(|_| ProtocolError::FieldRange("listen_port"))?;
        let id = NodeId::from_slice(item.at(5)?.as_bytes()?)
            .map_err(|_| ProtocolError::FieldRange("id"))?;

        Ok(Self {
            protocol_version,
            client_version,
            caps,
            listen_port,
            id,
        })
    }
}

// ============================================================================
// Peer Advertisements
// ============================================================================

/// One entry of a Peers packet: an endpoint and the identity claimed to
/// live there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAdvert {
    pub endpoint: Endpoint,
    pub id: NodeId,
}

impl PeerAdvert {
    /// Encode as a `[address, port, id]` list item. The address is 4 raw
    /// bytes for IPv4 and 16 for IPv6.
    pub fn to_item(&self) -> Item {
        Item::list(vec![
            Item::bytes(self.endpoint.address_bytes()),
            Item::uint(self.endpoint.port as u64),
            Item::bytes(self.id.as_bytes().to_vec()),
        ])
    }

    /// Decode from a `[address, port, id]` list item. An address that is
    /// neither 4 nor 16 bytes is a protocol error.
    pub fn from_item(item: &Item) -> Result<Self, ProtocolError> {
        let addr_bytes = item.at(0)?.as_bytes()?;
        let addr = match addr_bytes.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(addr_bytes);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(addr_bytes);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            n => return Err(ProtocolError::AddressLength(n)),
        };
        let port = u16::try_from(item.at(1)?.as_uint()?)
            .map_err(|_| ProtocolError::FieldRange("port"))?;
        let id = NodeId::from_slice(item.at(2)?.as_bytes()?)
            .map_err(|_| ProtocolError::FieldRange("id"))?;

        Ok(Self {
            endpoint: Endpoint::new(addr, port),
            id,
        })
    }
}

/// Build a bodyless packet payload (Ping, Pong, GetPeers).
pub fn bare_packet(packet_type: PacketType) -> Item {
    Item::list(vec![Item::uint(packet_type.to_byte() as u64)])
}

/// Build a Disconnect packet payload.
pub fn disconnect_packet(reason: DisconnectReason) -> Item {
    Item::list(vec![
        Item::uint(PacketType::Disconnect.to_byte() as u64),
        Item::uint(reason.to_byte() as u64),
    ])
}
