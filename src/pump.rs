//! Host-side buffer pump.
//!
//! One outbound and one inbound block buffer sit between the client API and
//! the device. A periodic tick ships the outbound buffer (when non-empty) and
//! polls the inbound one; client reads and writes that cannot complete
//! against the buffers are parked and replayed after every transfer.
//!
//! Buffer access is guarded two ways: a `Mutex` over the pump state for
//! short critical sections, and an advisory busy token (`AtomicBool`) that
//! serializes whole transfer cycles. A tick that finds the token taken just
//! skips. The token holder always finishes by replaying parked requests, so
//! nothing is stranded.
//!
//! A write that drains the outbound buffer chains directly into a read when
//! the inbound side is exhausted, without giving up the token in between.
//! That keeps one tick's worth of latency out of the common
//! request-then-reply exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::buffer::ByteBuffer;
use crate::error::Result;
use crate::protocol::{Frame, BLOCK_SIZE, REPLY_TAG};
use crate::registry::{IoOutcome, PendingRegistry, PendingRequest, Transfer};
use crate::transport::BlockDevice;

/// The sector negotiated (or assumed) to carry tunnel frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicSector {
    pub drive: u8,
    pub sector: u32,
}

/// Counters exposed by [`BufferPump::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TunnelStats {
    /// Payload bytes shipped to the peripheral.
    pub bytes_written: u64,
    /// Payload bytes received from the peripheral.
    pub bytes_read: u64,
    /// Device I/O failures; each is retried on a later tick.
    pub transport_faults: u64,
    /// Malformed reply frames discarded.
    pub protocol_faults: u64,
    /// Requests currently parked.
    pub pending_requests: usize,
}

impl TunnelStats {
    /// Render as a JSON object for status surfaces.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Everything the mutex guards.
#[derive(Debug)]
struct PumpState {
    outbound: ByteBuffer,
    inbound: ByteBuffer,
    /// Bytes the peripheral advertised beyond what the last reply carried.
    extra_available: usize,
    registry: PendingRegistry,
    bytes_written: u64,
    bytes_read: u64,
    transport_faults: u64,
    protocol_faults: u64,
}

impl PumpState {
    fn new() -> Self {
        Self {
            outbound: ByteBuffer::outbound(),
            inbound: ByteBuffer::inbound(),
            extra_available: 0,
            registry: PendingRegistry::new(),
            bytes_written: 0,
            bytes_read: 0,
            transport_faults: 0,
            protocol_faults: 0,
        }
    }
}

/// What a tick decided to do with the device.
enum Action {
    /// Ship this encoded block; `usize` is the payload length staged in it.
    Write([u8; BLOCK_SIZE], usize),
    Read,
    Idle,
}

/// Outcome of a client submission.
#[derive(Debug)]
pub enum Submitted {
    /// The write was staged in full.
    Written(usize),
    /// The read was satisfied in full.
    Read(Bytes),
    /// Parked; the receiver resolves when a later cycle completes it.
    Pending(oneshot::Receiver<IoOutcome>),
}

/// The pump: buffers, registry, and the device they drive.
pub struct BufferPump<D> {
    device: D,
    magic: MagicSector,
    busy: AtomicBool,
    state: Mutex<PumpState>,
    /// Signalled when a submission wants a transfer sooner than next tick.
    wake: Notify,
}

impl<D: BlockDevice> BufferPump<D> {
    pub fn new(device: D, magic: MagicSector) -> Self {
        Self {
            device,
            magic,
            busy: AtomicBool::new(false),
            state: Mutex::new(PumpState::new()),
            wake: Notify::new(),
        }
    }

    #[inline]
    pub fn magic_sector(&self) -> MagicSector {
        self.magic
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PumpState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waiting on this resolves after the next submission-driven wake.
    pub(crate) async fn wakeup(&self) {
        self.wake.notified().await;
    }

    /// Bytes deliverable to readers right now: buffered plus advertised.
    pub fn available(&self) -> usize {
        let state = self.lock();
        state.inbound.remaining() + state.extra_available
    }

    pub fn stats(&self) -> TunnelStats {
        let state = self.lock();
        TunnelStats {
            bytes_written: state.bytes_written,
            bytes_read: state.bytes_read,
            transport_faults: state.transport_faults,
            protocol_faults: state.protocol_faults,
            pending_requests: state.registry.len(),
        }
    }

    /// Stage a write, parking the remainder if it does not fit.
    pub async fn submit_write(&self, client: u32, data: Bytes) -> Submitted {
        self.submit(client, Transfer::write(data)).await
    }

    /// Request `len` bytes, parking until enough have arrived.
    pub async fn submit_read(&self, client: u32, len: usize) -> Submitted {
        self.submit(client, Transfer::read(len)).await
    }

    async fn submit(&self, client: u32, mut transfer: Transfer) -> Submitted {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            let PumpState {
                inbound, outbound, ..
            } = &mut *state;
            let before = inbound.remaining();
            let complete = transfer.advance(inbound, outbound);
            let consumed = (before - inbound.remaining()) as u64;
            state.bytes_read += consumed;
            if complete {
                match transfer.into_outcome() {
                    IoOutcome::Written(n) => {
                        drop(state);
                        self.wake.notify_one();
                        return Submitted::Written(n);
                    }
                    IoOutcome::Read(bytes) => {
                        return Submitted::Read(bytes);
                    }
                }
            }
            state
                .registry
                .park(client, PendingRequest { transfer, done: tx });
        }
        self.wake.notify_one();
        Submitted::Pending(rx)
    }

    /// One pump cycle: ship outbound if non-empty, else poll inbound.
    ///
    /// Skips entirely when another cycle holds the busy token. Device faults
    /// are counted and the cycle ends; the buffers are untouched so the next
    /// tick retries the same transfer.
    pub async fn tick(&self) -> Result<()> {
        if self.busy.swap(true, Ordering::AcqRel) {
            trace!("pump busy, skipping tick");
            return Ok(());
        }

        let result = self.cycle().await;
        self.wake_and_release();
        result
    }

    async fn cycle(&self) -> Result<()> {
        let action = {
            let state = self.lock();
            let staged = state.outbound.filled();
            if !staged.is_empty() {
                // staged.len() <= MAX_PAYLOAD by construction, so both
                // fallible steps are infallible here.
                match Frame::request(Bytes::copy_from_slice(staged))
                    .and_then(|f| f.encode_block())
                {
                    Ok(block) => Action::Write(block, staged.len()),
                    Err(_) => Action::Idle,
                }
            } else if state.inbound.is_exhausted() {
                Action::Read
            } else {
                Action::Idle
            }
        };

        match action {
            Action::Write(block, sent) => {
                match self
                    .device
                    .write_block(self.magic.drive, self.magic.sector, &[], &block)
                    .await
                {
                    Ok(()) => {
                        let chain_read = {
                            let mut state = self.lock();
                            state.outbound.clear();
                            state.bytes_written += sent as u64;
                            state.inbound.is_exhausted()
                        };
                        debug!(sent, "shipped outbound block");
                        // Chain into a poll while we still hold the token.
                        if chain_read {
                            self.poll_inbound().await?;
                        }
                        Ok(())
                    }
                    Err(e) => {
                        let mut state = self.lock();
                        state.transport_faults += 1;
                        warn!(error = %e, "write transfer failed, will retry");
                        Err(e)
                    }
                }
            }
            Action::Read => self.poll_inbound().await,
            Action::Idle => Ok(()),
        }
    }

    async fn poll_inbound(&self) -> Result<()> {
        let data = match self
            .device
            .read_block(self.magic.drive, self.magic.sector)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                let mut state = self.lock();
                state.transport_faults += 1;
                warn!(error = %e, "read transfer failed, will retry");
                return Err(e);
            }
        };

        let mut state = self.lock();
        match Frame::decode_block(&data.block, REPLY_TAG) {
            Ok(frame) => {
                state.inbound.load(frame.payload());
                state.extra_available =
                    frame.advertised_len().saturating_sub(frame.payload_len());
                trace!(
                    got = frame.payload_len(),
                    extra = state.extra_available,
                    "polled inbound block"
                );
            }
            Err(e) => {
                state.protocol_faults += 1;
                warn!(error = %e, "discarding malformed reply block");
            }
        }
        Ok(())
    }

    /// Replay parked requests, then hand the busy token back.
    ///
    /// Replayed writes are only counted once their bytes actually ship, so
    /// only the read side of the replay tally lands in the stats here.
    fn wake_and_release(&self) {
        {
            let mut state = self.lock();
            let PumpState {
                registry,
                inbound,
                outbound,
                ..
            } = &mut *state;
            let (read, _staged) = registry.replay(inbound, outbound);
            state.bytes_read += read;
        }
        self.busy.store(false, Ordering::Release);
        // Anything staged during replay wants another cycle.
        self.wake.notify_one();
    }
}
