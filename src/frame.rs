//! Wire framing.
//!
//! Every on-wire frame starts with a fixed 4-byte synchronisation token
//! followed by a 4-byte big-endian payload length. The payload is one
//! structural item (see `codec`) whose self-reported size must match the
//! declared length exactly.
//!
//! ## Wire Format
//!
//! ```text
//! offset  0   1   2   3   4   5   6   7   8 .. 8+L-1
//! bytes   22  40  08  91  L3  L2  L1  L0  <payload of L bytes>
//! ```
//!
//! The framing carries no authentication; a token mismatch means the byte
//! stream is corrupt and the session cannot resynchronise.

use crate::codec::Item;

/// Fixed 4-byte synchronisation token beginning every frame.
pub const SYNC_TOKEN: [u8; 4] = [0x22, 0x40, 0x08, 0x91];

/// Size of the frame header (token + length).
pub const HEADER_SIZE: usize = 8;

/// Upper bound on a declared payload length. A frame claiming more is
/// treated as corruption before any buffering is attempted.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Outcome of attempting to pull one frame off the accumulation buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Extract {
    /// Not enough bytes buffered yet; read more.
    NeedMore,
    /// The buffer does not start with the synchronisation token.
    BadToken,
    /// The declared payload length exceeds `MAX_PAYLOAD`.
    Oversize(usize),
    /// A complete frame is buffered; its payload occupies
    /// `HEADER_SIZE..HEADER_SIZE + payload_len`.
    Frame { payload_len: usize },
}

/// Peek at the front of `accum` for one complete frame.
///
/// Does not validate the payload; callers run [`validate`] on the full
/// frame slice once it is known to be complete.
pub fn extract_one(accum: &[u8]) -> Extract {
    if accum.len() < HEADER_SIZE {
        return Extract::NeedMore;
    }
    if accum[..4] != SYNC_TOKEN {
        return Extract::BadToken;
    }
    let payload_len = u32::from_be_bytes([accum[4], accum[5], accum[6], accum[7]]) as usize;
    if payload_len > MAX_PAYLOAD {
        return Extract::Oversize(payload_len);
    }
    if accum.len() < HEADER_SIZE + payload_len {
        return Extract::NeedMore;
    }
    Extract::Frame { payload_len }
}

/// Check a complete frame for well-formedness.
///
/// A frame is valid when it is at least a header long, starts with the
/// synchronisation token, declares exactly the payload it carries, and the
/// payload's self-reported structural size equals the declared length.
pub fn validate(frame: &[u8]) -> bool {
    if frame.len() < HEADER_SIZE {
        return false;
    }
    if frame[..4] != SYNC_TOKEN {
        return false;
    }
    let declared = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    if declared != frame.len() - HEADER_SIZE {
        return false;
    }
    match Item::decode(&frame[HEADER_SIZE..]) {
        Ok((_, used)) => used == declared,
        Err(_) => false,
    }
}

/// Fill in the 8-byte frame header of an outgoing packet in place.
///
/// The packet must have been prepared with an 8-byte placeholder before the
/// payload. Packets shorter than a header are left untouched.
pub fn seal(packet: &mut [u8]) {
    if packet.len() < HEADER_SIZE {
        return;
    }
    let payload_len = (packet.len() - HEADER_SIZE) as u32;
    packet[..4].copy_from_slice(&SYNC_TOKEN);
    packet[4..8].copy_from_slice(&payload_len.to_be_bytes());
}

/// Build a sealed frame around one structural item.
pub fn encode(payload: &Item) -> Vec<u8> {
    let mut packet = vec![0u8; HEADER_SIZE];
    payload.encode_into(&mut packet);
    seal(&mut packet);
    packet
}
