//! Sub-protocol capabilities.
//!
//! A capability is a named, versioned sub-protocol plugged into a session.
//! Each registered capability owns a contiguous range of packet ids starting
//! at its assigned offset; the dispatcher hands it packets from that range
//! with the id rebased to the capability's own numbering.

use crate::codec::{CodecError, Item};
use std::fmt;

/// Name and version of a capability, as advertised in the handshake.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapabilityInfo {
    pub name: String,
    pub version: u64,
}

impl CapabilityInfo {
    /// Create a capability descriptor.
    pub fn new(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Encode as a `[name, version]` list item.
    pub fn to_item(&self) -> Item {
        Item::list(vec![Item::str(&self.name), Item::uint(self.version)])
    }

    /// Decode from a `[name, version]` list item.
    pub fn from_item(item: &Item) -> Result<Self, CodecError> {
        Ok(Self {
            name: item.at(0)?.as_str()?.to_string(),
            version: item.at(1)?.as_uint()?,
        })
    }
}

impl fmt::Display for CapabilityInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// A sub-protocol handler bound to one session.
///
/// Handlers run on the session's read task, so calls to `interpret` for a
/// given session are strictly ordered and never concurrent. A handler that
/// returns `false` fails the session.
pub trait Capability: Send {
    /// Number of packet ids this capability reserves.
    fn message_count(&self) -> u8;

    /// Handle one packet. `local_id` is the packet id rebased to this
    /// capability's range; `payload` is the full structural payload.
    fn interpret(&mut self, local_id: u8, payload: &Item) -> bool;
}

/// A capability instance registered on a session, with its assigned id
/// range.
pub(crate) struct RegisteredCapability {
    pub info: CapabilityInfo,
    pub id_offset: u8,
    pub enabled: bool,
    pub handler: Box<dyn Capability>,
}

impl RegisteredCapability {
    /// Whether this capability claims the given packet id.
    pub fn claims(&self, packet_id: u8) -> bool {
        self.enabled
            && packet_id >= self.id_offset
            && packet_id - self.id_offset < self.handler.message_count()
    }
}
