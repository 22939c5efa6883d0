//! Node identity.
//!
//! Node identifiers are opaque 32-byte strings. The session layer never
//! interprets them cryptographically; it only compares them, checks for the
//! null identity, and carries them on the wire.

use std::fmt;
use thiserror::Error;

/// Errors related to identity handling.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid node id length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex in node id: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Opaque 32-byte node identifier.
///
/// The all-zero value is the null identity, used as a sentinel before a
/// remote's identity is learned. A peer advertising the null identity is
/// rejected during the handshake.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Create a NodeId from a 32-byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a NodeId from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, IdentityError> {
        if slice.len() != 32 {
            return Err(IdentityError::InvalidLength(slice.len()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Parse a NodeId from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim())?;
        Self::from_slice(&bytes)
    }

    /// Generate a random NodeId.
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    /// The null (all-zero) identity.
    pub fn null() -> Self {
        Self([0u8; 32])
    }

    /// Check whether this is the null identity.
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abridged hex form for log lines (first 4 bytes).
    pub fn short(&self) -> String {
        format!("{}..", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
