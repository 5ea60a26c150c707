//! Transport layer - the block-device seam the host pump drives.
//!
//! Everything above this module speaks in whole sectors: a read returns the
//! 512-byte data area plus the out-of-band tag area, a write supplies both.
//! [`BlockDevice`] is the only surface a real medium has to implement.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{BLOCK_SIZE, TAG_SIZE};

pub mod mem;

pub use mem::MemBlockDevice;

/// One sector as returned by a read: tag area plus data area.
#[derive(Debug, Clone, Copy)]
pub struct SectorData {
    pub tags: [u8; TAG_SIZE],
    pub block: [u8; BLOCK_SIZE],
}

impl SectorData {
    /// A zero-filled sector.
    pub fn zeroed() -> Self {
        Self {
            tags: [0u8; TAG_SIZE],
            block: [0u8; BLOCK_SIZE],
        }
    }
}

/// Raw sector access to the medium carrying the tunnel.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Read one sector, returning its tag and data areas.
    async fn read_block(&self, drive: u8, sector: u32) -> Result<SectorData>;

    /// Write one sector's tag and data areas.
    async fn write_block(&self, drive: u8, sector: u32, tags: &[u8], block: &[u8]) -> Result<()>;
}
