//! In-memory block device with an attached peripheral endpoint.
//!
//! Every sector operation is offered to the [`Endpoint`] first; only
//! pass-through traffic reaches the backing sector map. This is the test
//! double for the whole stack and the reference for wiring a real medium:
//! a hardware transport makes the same `handle_io` call from its sector
//! service path.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BlockDevice, SectorData};
use crate::error::Result;
use crate::handshake::{Direction, Endpoint, IoEvent, Verdict};
use crate::protocol::{BLOCK_SIZE, TAG_SIZE};

/// A peripheral endpoint backed by a sector map instead of real storage.
#[derive(Debug)]
pub struct MemBlockDevice {
    endpoint: Mutex<Endpoint>,
    sectors: Mutex<HashMap<(u8, u32), [u8; BLOCK_SIZE]>>,
}

impl MemBlockDevice {
    pub fn new() -> Self {
        Self::with(Endpoint::new())
    }

    /// A device whose endpoint echoes host writes back to the host.
    pub fn loopback() -> Self {
        Self::with(Endpoint::loopback())
    }

    fn with(endpoint: Endpoint) -> Self {
        Self {
            endpoint: Mutex::new(endpoint),
            sectors: Mutex::new(HashMap::new()),
        }
    }

    /// Run a closure against the peripheral endpoint.
    ///
    /// Tests and demo drivers use this to queue bytes toward the host or
    /// collect what the host sent.
    pub fn with_endpoint<R>(&self, f: impl FnOnce(&mut Endpoint) -> R) -> R {
        let mut endpoint = self.endpoint.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut endpoint)
    }

    /// Store plain disk data in a sector, bypassing the endpoint.
    pub fn seed_sector(&self, drive: u8, sector: u32, data: [u8; BLOCK_SIZE]) {
        let mut sectors = self.sectors.lock().unwrap_or_else(|e| e.into_inner());
        sectors.insert((drive, sector), data);
    }
}

impl Default for MemBlockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockDevice for MemBlockDevice {
    async fn read_block(&self, drive: u8, sector: u32) -> Result<SectorData> {
        let mut data = SectorData::zeroed();

        let verdict = self.with_endpoint(|endpoint| {
            endpoint.handle_io(IoEvent {
                drive,
                sector,
                direction: Direction::Read,
                tags: &mut data.tags,
                block: &mut data.block,
            })
        });

        if verdict == Verdict::PassThrough {
            let sectors = self.sectors.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(stored) = sectors.get(&(drive, sector)) {
                data.block = *stored;
            }
        }
        Ok(data)
    }

    async fn write_block(&self, drive: u8, sector: u32, tags: &[u8], block: &[u8]) -> Result<()> {
        let mut tag_buf = [0u8; TAG_SIZE];
        let n = tags.len().min(TAG_SIZE);
        tag_buf[..n].copy_from_slice(&tags[..n]);

        let mut block_buf = [0u8; BLOCK_SIZE];
        let n = block.len().min(BLOCK_SIZE);
        block_buf[..n].copy_from_slice(&block[..n]);

        let verdict = self.with_endpoint(|endpoint| {
            endpoint.handle_io(IoEvent {
                drive,
                sector,
                direction: Direction::Write,
                tags: &mut tag_buf,
                block: &mut block_buf,
            })
        });

        if verdict == Verdict::PassThrough {
            let mut sectors = self.sectors.lock().unwrap_or_else(|e| e.into_inner());
            sectors.insert((drive, sector), block_buf);
        }
        Ok(())
    }
}
