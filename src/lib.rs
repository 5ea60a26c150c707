//! # blockwire
//!
//! Byte-stream tunneling over raw 512-byte block-storage I/O.
//!
//! A host that can only issue sector reads and writes, and a peripheral that
//! emulates the storage medium, agree on one "magic" sector; frames written
//! to and read from that sector then carry an ordered byte stream in each
//! direction, while every other sector keeps behaving as plain storage.
//!
//! ## Architecture
//!
//! ```text
//! host side                                  peripheral side
//! ─────────                                  ───────────────
//! Tunnel (tick loop, byte API)
//!   └─ BufferPump (staging buffers,          Endpoint (knock detector,
//!      parked requests)                        sector binding)
//!        └─ BlockDevice ──── sectors ────────── SectorChannel (byte queues)
//! ```
//!
//! - [`protocol`] - the 12-byte header, frame codec, protocol constants
//! - [`handshake`] - peripheral-side discovery and sector negotiation
//! - [`channel`] - the byte queues behind the bound sector
//! - [`buffer`] / [`registry`] / [`pump`] - the host-side transfer engine
//! - [`tunnel`] - host negotiation and the public byte-stream handle
//! - [`transport`] - the [`BlockDevice`](transport::BlockDevice) seam and an
//!   in-memory implementation
//!
//! ## Quick start
//!
//! ```
//! use blockwire::transport::MemBlockDevice;
//! use blockwire::tunnel::Tunnel;
//! use bytes::Bytes;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> blockwire::Result<()> {
//! // A loopback peripheral echoes everything the host sends.
//! let device = MemBlockDevice::loopback();
//! let tunnel = Tunnel::connect(device, 1, 99).await?;
//!
//! tunnel.write(1, Bytes::from_static(b"hello")).await;
//! tunnel.pump_once().await?;
//! assert_eq!(&tunnel.read(1, 5).await[..], b"hello");
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod channel;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod pump;
pub mod registry;
pub mod transport;
pub mod tunnel;

pub use error::{Result, TunnelError};
pub use pump::{MagicSector, TunnelStats};
pub use tunnel::Tunnel;
