//! Wire format encoding and decoding.
//!
//! Implements the 12-byte header that, together with a maximum payload of
//! 500 bytes, exactly fills one 512-byte block:
//!
//! ```text
//! ┌──────────┬────────┬────────┬──────────┬──────────┐
//! │ Tag      │ Src    │ Dst    │ Length   │ Reserved │
//! │ 4 bytes  │ 1 byte │ 1 byte │ 2 bytes  │ 4 bytes  │
//! │          │        │        │ uint16 BE│ zero     │
//! └──────────┴────────┴────────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The same 12-byte layout is also
//! placed in a sector's out-of-band tag area at certain handshake steps.

use crate::error::{Result, TunnelError};

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// On-wire block size; every frame occupies exactly one block.
pub const BLOCK_SIZE: usize = 512;

/// Maximum payload bytes carried by one block.
pub const MAX_PAYLOAD: usize = BLOCK_SIZE - HEADER_SIZE;

/// Size of the out-of-band tag area handed to the verdict interface.
///
/// Callers may supply 12 or 20 bytes; only the first [`HEADER_SIZE`] are used.
pub const TAG_SIZE: usize = 20;

/// Tag marking host-originated (request) frames.
pub const REQUEST_TAG: [u8; 4] = *b"NDEV";

/// Tag marking peripheral-originated (reply) frames.
pub const REPLY_TAG: [u8; 4] = *b"FUJI";

/// Ordered sector probes whose access pattern announces the tunnel protocol.
pub const KNOCK_SEQUENCE: [u32; 5] = [0, 70, 85, 74, 73];

/// Reserved out-of-range sector routed to the channel at all times.
///
/// A host that already knows the protocol may skip sector negotiation and
/// address this sentinel directly.
pub const SENTINEL_SECTOR: u32 = 0x007F_FFFF;

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sender-role tag ([`REQUEST_TAG`] or [`REPLY_TAG`]).
    pub tag: [u8; 4],
    /// Source endpoint id.
    pub src: u8,
    /// Destination endpoint id.
    pub dst: u8,
    /// Payload length in bytes.
    ///
    /// Request headers never exceed [`MAX_PAYLOAD`]. Reply headers advertise
    /// the peripheral's *true total* queued byte count, which may exceed
    /// [`MAX_PAYLOAD`]; the block then carries only the first 500 bytes and a
    /// value of 500 or more means "more data may be waiting, re-request".
    /// This is a fixed wire-protocol convention.
    pub length: u16,
}

impl Header {
    /// Create a header with an explicit tag.
    pub fn new(tag: [u8; 4], length: u16) -> Self {
        Self {
            tag,
            src: 0,
            dst: 0,
            length,
        }
    }

    /// Create a host-side request header.
    pub fn request(length: u16) -> Self {
        Self::new(REQUEST_TAG, length)
    }

    /// Create a peripheral-side reply header.
    pub fn reply(length: u16) -> Self {
        Self::new(REPLY_TAG, length)
    }

    /// Encode header to bytes (Big Endian, reserved field zeroed).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (12 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.tag);
        buf[4] = self.src;
        buf[5] = self.dst;
        buf[6..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8..12].fill(0);
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short. The reserved bytes are not
    /// inspected; integrity is guaranteed by the block-storage medium.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            tag: [buf[0], buf[1], buf[2], buf[3]],
            src: buf[4],
            dst: buf[5],
            length: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }

    /// Decode a header and require a specific tag.
    ///
    /// This is how the channel tells a tunneled write apart from stray disk
    /// data landing on the bound sector.
    pub fn decode_tagged(buf: &[u8], expected: [u8; 4]) -> Option<Self> {
        Header::decode(buf).filter(|h| h.tag == expected)
    }

    /// Validate the tag against the constant expected for the decoding side.
    pub fn expect_tag(&self, expected: [u8; 4]) -> Result<()> {
        if self.tag == expected {
            Ok(())
        } else {
            Err(TunnelError::BadTag(self.tag))
        }
    }
}

/// Publish a reply header into a caller's tag area.
///
/// Used at knock completion (length 0, "peripheral present") and at the
/// magic-read step (length 8). Tag areas shorter than a full header are
/// ignored with a warning rather than panicking, since the verdict interface
/// does not control its caller's buffers.
pub fn publish_reply_header(tags: &mut [u8], length: u16) {
    if tags.len() < HEADER_SIZE {
        tracing::warn!(len = tags.len(), "tag area too short for reply header");
        return;
    }
    Header::reply(length).encode_into(&mut tags[..HEADER_SIZE]);
}

/// Check whether a block is the magic-sector designation pattern:
/// the 4-byte request tag repeated for the full 512 bytes.
pub fn is_magic_block(block: &[u8]) -> bool {
    block.len() == BLOCK_SIZE && block.chunks_exact(4).all(|c| c == REQUEST_TAG)
}
