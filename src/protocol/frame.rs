//! Frame struct with full-block encode/decode.
//!
//! A frame is the 512-byte wire unit: a 12-byte [`Header`] followed by up to
//! 500 payload bytes, zero-padded to the block size. Short payloads still
//! occupy a full block. Uses `bytes::Bytes` for cheap payload sharing.
//!
//! # Example
//!
//! ```
//! use blockwire::protocol::{Frame, BLOCK_SIZE, REQUEST_TAG};
//! use bytes::Bytes;
//!
//! let frame = Frame::request(Bytes::from_static(b"hello")).unwrap();
//! let block = frame.encode_block().unwrap();
//! assert_eq!(block.len(), BLOCK_SIZE);
//!
//! let decoded = Frame::decode_block(&block, REQUEST_TAG).unwrap();
//! assert_eq!(decoded.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, BLOCK_SIZE, HEADER_SIZE, MAX_PAYLOAD};
use crate::error::{Result, TunnelError};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes actually carried by the block (at most 500).
    pub payload: Bytes,
}

impl Frame {
    /// Create a host-side request frame.
    ///
    /// The header length always equals the payload length; requests never
    /// advertise more than one block's worth of data.
    pub fn request(payload: Bytes) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(TunnelError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            header: Header::request(payload.len() as u16),
            payload,
        })
    }

    /// Create a peripheral-side reply frame.
    ///
    /// `advertised` is the peripheral's true total of queued bytes and may
    /// exceed the payload carried here; the host fetches the excess through
    /// follow-up polls. Totals beyond `u16::MAX` are saturated.
    pub fn reply(payload: Bytes, advertised: usize) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(TunnelError::FrameTooLarge(payload.len()));
        }
        debug_assert!(advertised >= payload.len());
        Ok(Self {
            header: Header::reply(advertised.min(u16::MAX as usize) as u16),
            payload,
        })
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the number of payload bytes present in this block.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Get the advertised length from the header.
    ///
    /// For replies this is the peripheral's true total and may exceed
    /// [`MAX_PAYLOAD`].
    #[inline]
    pub fn advertised_len(&self) -> usize {
        self.header.length as usize
    }

    /// Whether the sender signalled that more data may be waiting.
    ///
    /// An advertised length of exactly 500 (or more) is the back-pressure
    /// signal to re-request; a shorter reply is known-complete.
    #[inline]
    pub fn more_pending(&self) -> bool {
        self.advertised_len() >= MAX_PAYLOAD
    }

    /// Encode into a freshly zeroed 512-byte block.
    pub fn encode_block(&self) -> Result<[u8; BLOCK_SIZE]> {
        let mut block = [0u8; BLOCK_SIZE];
        self.encode_into(&mut block)?;
        Ok(block)
    }

    /// Encode into an existing buffer, zero-filling the remainder.
    ///
    /// The buffer must hold at least header plus payload; the canonical size
    /// is [`BLOCK_SIZE`].
    pub fn encode_into(&self, block: &mut [u8]) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(TunnelError::FrameTooLarge(self.payload.len()));
        }
        if block.len() < HEADER_SIZE + self.payload.len() {
            return Err(TunnelError::HeaderTooShort(block.len()));
        }
        block.fill(0);
        self.header.encode_into(&mut block[..HEADER_SIZE]);
        block[HEADER_SIZE..HEADER_SIZE + self.payload.len()].copy_from_slice(&self.payload);
        Ok(())
    }

    /// Decode a frame from a block, requiring the given tag.
    ///
    /// Fails with [`TunnelError::BadTag`] on a tag mismatch. No checksum is
    /// validated; integrity is assumed from the block-storage medium. The
    /// payload taken is `min(advertised length, 500)` bytes.
    pub fn decode_block(block: &[u8], expected_tag: [u8; 4]) -> Result<Self> {
        let header = Header::decode(block).ok_or(TunnelError::HeaderTooShort(block.len()))?;
        header.expect_tag(expected_tag)?;

        let take = (header.length as usize)
            .min(MAX_PAYLOAD)
            .min(block.len() - HEADER_SIZE);
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&block[HEADER_SIZE..HEADER_SIZE + take]),
        })
    }
}
