//! Host-side tunnel: negotiation plus the pump running behind a task.
//!
//! [`negotiate`] performs the discovery handshake over a [`BlockDevice`] and
//! returns the bound [`MagicSector`]. [`Tunnel`] wraps a [`BufferPump`] in an
//! `Arc`, spawns the periodic tick loop, and exposes the byte-stream API.
//!
//! # Example
//!
//! ```
//! use blockwire::transport::MemBlockDevice;
//! use blockwire::tunnel::Tunnel;
//! use bytes::Bytes;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> blockwire::Result<()> {
//! let device = MemBlockDevice::loopback();
//! let tunnel = Tunnel::connect(device, 1, 99).await?;
//!
//! tunnel.write(1, Bytes::from_static(b"ping")).await;
//! tunnel.pump_once().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Result, TunnelError};
use crate::protocol::{Header, BLOCK_SIZE, KNOCK_SEQUENCE, REPLY_TAG, REQUEST_TAG, TAG_SIZE};
use crate::pump::{BufferPump, MagicSector, Submitted, TunnelStats};
use crate::registry::IoOutcome;
use crate::transport::BlockDevice;

/// Default tick period, roughly matching a 60 Hz frame counter's 30-tick
/// polling interval.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(500);

/// Discover the peripheral and bind `preferred_sector` as the magic sector.
///
/// Knocks by reading the probe sequence, checks the final probe's tag area
/// for the presence mark, writes the designation pattern, and reads it back
/// to confirm. Fails with [`TunnelError::NotConnected`] if the medium never
/// answers; callers retry at their own pace.
pub async fn negotiate<D: BlockDevice>(
    device: &D,
    drive: u8,
    preferred_sector: u32,
) -> Result<MagicSector> {
    let mut marked = false;
    for &probe in &KNOCK_SEQUENCE {
        let data = device.read_block(drive, probe).await?;
        marked = Header::decode_tagged(&data.tags, REPLY_TAG).is_some();
    }
    if !marked {
        debug!(drive, "no presence mark after knock");
        return Err(TunnelError::NotConnected);
    }

    // Designate the sector: the request tag repeated across the block.
    let mut magic = [0u8; BLOCK_SIZE];
    for chunk in magic.chunks_exact_mut(4) {
        chunk.copy_from_slice(&REQUEST_TAG);
    }
    device
        .write_block(drive, preferred_sector, &[0u8; TAG_SIZE], &magic)
        .await?;

    // Read back: the reply tag plus the bound sector number.
    let confirm = device.read_block(drive, preferred_sector).await?;
    if confirm.block[..4] != REPLY_TAG {
        return Err(TunnelError::NotConnected);
    }
    let sector = u32::from_be_bytes([
        confirm.block[4],
        confirm.block[5],
        confirm.block[6],
        confirm.block[7],
    ]);

    info!(drive, sector, "tunnel negotiated");
    Ok(MagicSector { drive, sector })
}

/// A connected byte-stream tunnel over a block device.
pub struct Tunnel<D: BlockDevice> {
    pump: Arc<BufferPump<D>>,
    ticker: Option<JoinHandle<()>>,
}

impl<D: BlockDevice + 'static> Tunnel<D> {
    /// Negotiate and start pumping at [`DEFAULT_TICK_PERIOD`].
    pub async fn connect(device: D, drive: u8, preferred_sector: u32) -> Result<Self> {
        let magic = negotiate(&device, drive, preferred_sector).await?;
        Ok(Self::open(device, magic))
    }

    /// Attach to an already-known magic sector and start pumping.
    ///
    /// Use [`SENTINEL_SECTOR`](crate::protocol::SENTINEL_SECTOR) to skip
    /// negotiation entirely.
    pub fn open(device: D, magic: MagicSector) -> Self {
        Self::open_with_period(device, magic, DEFAULT_TICK_PERIOD)
    }

    /// Like [`open`](Self::open) with an explicit tick period.
    pub fn open_with_period(device: D, magic: MagicSector, period: Duration) -> Self {
        let pump = Arc::new(BufferPump::new(device, magic));
        let ticker = Self::spawn_ticker(Arc::clone(&pump), period);
        Self {
            pump,
            ticker: Some(ticker),
        }
    }

    /// Attach without spawning the tick loop; the caller drives
    /// [`pump_once`](Self::pump_once) itself.
    pub fn open_manual(device: D, magic: MagicSector) -> Self {
        Self {
            pump: Arc::new(BufferPump::new(device, magic)),
            ticker: None,
        }
    }

    fn spawn_ticker(pump: Arc<BufferPump<D>>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = pump.wakeup() => {}
                }
                // Faults are already counted in the stats; the next pass
                // retries the same buffers.
                let _ = pump.tick().await;
            }
        })
    }

    /// Send bytes to the peripheral, waiting until all are staged.
    pub async fn write(&self, client: u32, data: Bytes) -> usize {
        match self.pump.submit_write(client, data).await {
            Submitted::Written(n) => n,
            Submitted::Pending(rx) => match rx.await {
                Ok(IoOutcome::Written(n)) => n,
                _ => 0,
            },
            Submitted::Read(_) => 0,
        }
    }

    /// Receive exactly `len` bytes, waiting for the peripheral as needed.
    pub async fn read(&self, client: u32, len: usize) -> Bytes {
        match self.pump.submit_read(client, len).await {
            Submitted::Read(bytes) => bytes,
            Submitted::Pending(rx) => match rx.await {
                Ok(IoOutcome::Read(bytes)) => bytes,
                _ => Bytes::new(),
            },
            Submitted::Written(_) => Bytes::new(),
        }
    }

    /// Bytes deliverable to readers right now, including the peripheral's
    /// advertised backlog.
    pub fn available(&self) -> usize {
        self.pump.available()
    }

    /// Transfer and fault counters.
    pub fn stats(&self) -> TunnelStats {
        self.pump.stats()
    }

    /// The negotiated sector this tunnel runs over.
    pub fn magic_sector(&self) -> MagicSector {
        self.pump.magic_sector()
    }

    /// Run one pump cycle immediately.
    pub async fn pump_once(&self) -> Result<()> {
        self.pump.tick().await
    }

    /// The device behind the pump.
    pub fn device(&self) -> &D {
        self.pump.device()
    }
}

impl<D: BlockDevice> Drop for Tunnel<D> {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}
