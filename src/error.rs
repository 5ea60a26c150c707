//! Error types for blockwire.

use thiserror::Error;

/// Main error type for all tunnel operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// I/O error reported by the underlying block device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame carried a tag other than the one expected for its direction.
    #[error("bad frame tag: {0:02x?}")]
    BadTag([u8; 4]),

    /// A frame payload would not fit in a single 512-byte block.
    #[error("frame payload of {0} bytes exceeds the 500-byte capacity")]
    FrameTooLarge(usize),

    /// A buffer was too short to hold a complete 12-byte header.
    #[error("header truncated: got {0} bytes")]
    HeaderTooShort(usize),

    /// The knock sequence or negotiation read-back got no valid reply.
    #[error("peripheral not detected")]
    NotConnected,
}

/// Result type alias using TunnelError.
pub type Result<T> = std::result::Result<T, TunnelError>;
