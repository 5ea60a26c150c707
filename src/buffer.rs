//! Fixed single-block staging buffers for the host pump.
//!
//! The pump owns exactly one outbound and one inbound [`ByteBuffer`] at a
//! time. Each tracks two cursors over a 500-byte array:
//!
//! - `requested` - how many bytes this buffer is set up to carry
//! - `consumed`  - how many of those have been moved so far
//!
//! Outbound: client writes fill `data` up to `requested` (the full capacity),
//! and the filled prefix is shipped as one frame. Inbound: a received frame
//! loads `data` with `requested = payload length`, and client reads advance
//! `consumed` through it.

use crate::protocol::MAX_PAYLOAD;

/// One block's worth of in-flight bytes.
#[derive(Debug)]
pub struct ByteBuffer {
    data: [u8; MAX_PAYLOAD],
    requested: usize,
    consumed: usize,
}

impl ByteBuffer {
    /// An empty buffer accepting up to a full block of outbound bytes.
    pub fn outbound() -> Self {
        Self {
            data: [0u8; MAX_PAYLOAD],
            requested: MAX_PAYLOAD,
            consumed: 0,
        }
    }

    /// An empty inbound buffer with nothing to deliver.
    pub fn inbound() -> Self {
        Self {
            data: [0u8; MAX_PAYLOAD],
            requested: 0,
            consumed: 0,
        }
    }

    /// Bytes still unmoved: free space (outbound) or undelivered (inbound).
    #[inline]
    pub fn remaining(&self) -> usize {
        self.requested - self.consumed
    }

    /// Whether every requested byte has been moved.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.consumed >= self.requested
    }

    /// Copy from `src` into the free space, returning how many bytes fit.
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.consumed..self.consumed + n].copy_from_slice(&src[..n]);
        self.consumed += n;
        n
    }

    /// The filled prefix (outbound payload to ship).
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.consumed]
    }

    /// The undelivered slice of a loaded inbound buffer.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.data[self.consumed..self.requested]
    }

    /// Mark `n` readable bytes as delivered.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.consumed += n;
    }

    /// Reset to empty-and-writable after the contents were shipped.
    pub fn clear(&mut self) {
        self.requested = MAX_PAYLOAD;
        self.consumed = 0;
    }

    /// Load a received payload, replacing whatever was here.
    ///
    /// Payloads longer than one block's worth are truncated; the excess is
    /// accounted separately by the pump.
    pub fn load(&mut self, src: &[u8]) {
        let n = src.len().min(MAX_PAYLOAD);
        self.data[..n].copy_from_slice(&src[..n]);
        self.requested = n;
        self.consumed = 0;
    }
}
