//! Peripheral-side discovery and sector negotiation.
//!
//! A host announces itself by reading a fixed sequence of sectors (the
//! "knock"). Once the full sequence is seen, the peripheral marks the next
//! read's tag area with a reply header so the host knows something answered.
//! The host then writes a designation pattern to the sector of its choosing,
//! and from that point on I/O to that sector carries tunnel frames instead of
//! disk data.
//!
//! [`Endpoint::handle_io`] is the single entry point the block-device layer
//! calls for every sector operation; the returned [`Verdict`] tells the
//! caller whether to fall through to real storage.

use tracing::{debug, info, warn};

use crate::channel::SectorChannel;
use crate::protocol::{
    is_magic_block, publish_reply_header, KNOCK_SEQUENCE, REPLY_TAG, SENTINEL_SECTOR,
};

/// Direction of a block operation as seen by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host is reading the sector.
    Read,
    /// Host is writing the sector.
    Write,
}

/// Whether an operation was consumed by the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The tunnel handled the operation; do not touch backing storage.
    Intercepted,
    /// Ordinary disk traffic; the caller services it normally.
    PassThrough,
}

/// One sector operation, with mutable access to its data areas.
///
/// For reads the tunnel fills `tags`/`block`; for writes it inspects them.
#[derive(Debug)]
pub struct IoEvent<'a> {
    /// Drive the operation addresses.
    pub drive: u8,
    /// Logical sector number.
    pub sector: u32,
    /// Read or write.
    pub direction: Direction,
    /// Out-of-band tag area (12 or 20 bytes).
    pub tags: &'a mut [u8],
    /// 512-byte data area.
    pub block: &'a mut [u8],
}

/// Progress through the discovery protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Watching sector reads for the knock sequence.
    Listening,
    /// Knock complete; the next read on the knock drive gets a presence mark.
    KnockSeen,
    /// Presence announced; waiting for the designation write.
    WaitMagicWrite,
    /// A sector is bound; the channel is live. Terminal.
    WaitMagicSector,
}

/// Knock detector and sector binding for one emulated drive set.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    /// Drive the knock arrived on; negotiation is pinned to it.
    drive: u8,
    /// The bound magic sector, valid in `WaitMagicSector`.
    sector: u32,
    /// Index of the next expected knock probe.
    knock: usize,
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Listening,
            drive: 0,
            sector: 0,
            knock: 0,
        }
    }

    /// The negotiated sector, once bound.
    pub fn magic_sector(&self) -> Option<(u8, u32)> {
        if self.state == HandshakeState::WaitMagicSector {
            Some((self.drive, self.sector))
        } else {
            None
        }
    }

    /// Feed one sector access into the knock detector.
    ///
    /// Returns `true` when this access completed the sequence. A mismatched
    /// sector, read or write, resets progress without re-checking against
    /// the first element; the host simply knocks again. Once a sector is
    /// bound, further knocks are acknowledged but never regress the binding.
    fn observe(&mut self, drive: u8, sector: u32) -> bool {
        if self.knock > 0 && drive != self.drive {
            self.knock = 0;
        }
        if sector == KNOCK_SEQUENCE[self.knock] {
            self.drive = drive;
            self.knock += 1;
            if self.knock == KNOCK_SEQUENCE.len() {
                self.knock = 0;
                debug!(drive, "knock sequence complete");
                return true;
            }
        } else {
            self.knock = 0;
        }
        false
    }

    /// Drop partial progress when unrelated traffic proves no handshake is
    /// actually underway.
    fn abandon_partial(&mut self) {
        if self.state != HandshakeState::WaitMagicSector {
            self.state = HandshakeState::Listening;
        }
        self.knock = 0;
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

/// A peripheral endpoint: handshake plus the channel behind it.
#[derive(Debug)]
pub struct Endpoint {
    handshake: Handshake,
    channel: SectorChannel,
    /// Whether the post-designation confirmation read has been served.
    confirmed: bool,
}

impl Endpoint {
    pub fn new() -> Self {
        Self {
            handshake: Handshake::new(),
            channel: SectorChannel::new(),
            confirmed: false,
        }
    }

    /// An endpoint whose channel echoes host writes back.
    pub fn loopback() -> Self {
        Self {
            channel: SectorChannel::loopback(),
            ..Self::new()
        }
    }

    /// Access the channel queues.
    #[inline]
    pub fn channel(&mut self) -> &mut SectorChannel {
        &mut self.channel
    }

    /// The negotiated sector, once bound.
    #[inline]
    pub fn magic_sector(&self) -> Option<(u8, u32)> {
        self.handshake.magic_sector()
    }

    /// Inspect one sector operation and decide whether the tunnel owns it.
    pub fn handle_io(&mut self, event: IoEvent<'_>) -> Verdict {
        // The sentinel sector belongs to the channel unconditionally, even
        // mid-handshake. Seeing it proves the host speaks the protocol some
        // other way, so partial knock progress is stale.
        if event.sector == SENTINEL_SECTOR {
            self.handshake.abandon_partial();
            return self.serve_channel(event);
        }

        // Every access feeds the knock detector, so a write mid-sequence
        // resets progress like any other deviation.
        if self.handshake.observe(event.drive, event.sector) {
            match self.handshake.state {
                HandshakeState::WaitMagicSector => {
                    // Already bound; acknowledge the re-knock without
                    // disturbing the binding.
                    if event.direction == Direction::Read {
                        publish_reply_header(event.tags, 0);
                    }
                }
                _ => self.handshake.state = HandshakeState::KnockSeen,
            }
        }

        match self.handshake.state {
            HandshakeState::Listening => Verdict::PassThrough,
            HandshakeState::KnockSeen => {
                // This is the read that completed the knock: serve the real
                // sector but mark the tag area so the host sees us.
                if event.direction == Direction::Read && event.drive == self.handshake.drive {
                    publish_reply_header(event.tags, 0);
                    self.handshake.state = HandshakeState::WaitMagicWrite;
                }
                Verdict::PassThrough
            }
            HandshakeState::WaitMagicWrite => match event.direction {
                Direction::Write
                    if event.drive == self.handshake.drive && is_magic_block(event.block) =>
                {
                    self.handshake.sector = event.sector;
                    self.handshake.state = HandshakeState::WaitMagicSector;
                    info!(
                        drive = event.drive,
                        sector = event.sector,
                        "magic sector designated"
                    );
                    Verdict::Intercepted
                }
                Direction::Write => {
                    // Any other write means the host moved on.
                    self.handshake.abandon_partial();
                    Verdict::PassThrough
                }
                Direction::Read => Verdict::PassThrough,
            },
            HandshakeState::WaitMagicSector => {
                // A fresh designation write re-binds, so a restarted host
                // can negotiate again without the peripheral power-cycling.
                if event.direction == Direction::Write
                    && event.drive == self.handshake.drive
                    && is_magic_block(event.block)
                {
                    self.handshake.sector = event.sector;
                    self.confirmed = false;
                    info!(sector = event.sector, "magic sector re-designated");
                    return Verdict::Intercepted;
                }
                if event.drive != self.handshake.drive || event.sector != self.handshake.sector {
                    if event.sector == self.handshake.sector {
                        warn!(
                            drive = event.drive,
                            sector = event.sector,
                            "bound sector addressed from wrong drive"
                        );
                    }
                    return Verdict::PassThrough;
                }
                match event.direction {
                    Direction::Read if !self.channel_confirmed() => {
                        // First read after designation: confirm the binding
                        // by echoing the reply tag and sector number.
                        self.confirm_binding(event.tags, event.block);
                        Verdict::Intercepted
                    }
                    _ => self.serve_channel(event),
                }
            }
        }
    }

    fn serve_channel(&mut self, event: IoEvent<'_>) -> Verdict {
        match event.direction {
            Direction::Read => {
                self.channel.service_read(event.block);
                Verdict::Intercepted
            }
            Direction::Write => {
                if self.channel.service_write(event.tags, event.block) {
                    Verdict::Intercepted
                } else {
                    // Malformed write on the bound sector: not ours.
                    warn!(sector = event.sector, "rejected write on bound sector");
                    Verdict::PassThrough
                }
            }
        }
    }

    fn channel_confirmed(&self) -> bool {
        self.confirmed
    }

    fn confirm_binding(&mut self, tags: &mut [u8], block: &mut [u8]) {
        publish_reply_header(tags, 8);
        block.fill(0);
        if block.len() >= 8 {
            block[..4].copy_from_slice(&REPLY_TAG);
            block[4..8].copy_from_slice(&self.handshake.sector.to_be_bytes());
        }
        self.confirmed = true;
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, Header, BLOCK_SIZE, REQUEST_TAG, TAG_SIZE};
    use bytes::Bytes;

    fn read(endpoint: &mut Endpoint, drive: u8, sector: u32) -> ([u8; TAG_SIZE], Verdict) {
        let mut tags = [0u8; TAG_SIZE];
        let mut block = [0u8; BLOCK_SIZE];
        let verdict = endpoint.handle_io(IoEvent {
            drive,
            sector,
            direction: Direction::Read,
            tags: &mut tags,
            block: &mut block,
        });
        (tags, verdict)
    }

    fn write(endpoint: &mut Endpoint, drive: u8, sector: u32, block: &[u8; BLOCK_SIZE]) -> Verdict {
        let mut tags = [0u8; TAG_SIZE];
        let mut data = *block;
        endpoint.handle_io(IoEvent {
            drive,
            sector,
            direction: Direction::Write,
            tags: &mut tags,
            block: &mut data,
        })
    }

    fn magic_block() -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        for chunk in block.chunks_exact_mut(4) {
            chunk.copy_from_slice(&REQUEST_TAG);
        }
        block
    }

    /// Run the full handshake, binding `sector` on `drive`.
    fn negotiate(endpoint: &mut Endpoint, drive: u8, sector: u32) {
        for &probe in &KNOCK_SEQUENCE {
            read(endpoint, drive, probe);
        }
        assert!(write(endpoint, drive, sector, &magic_block()) == Verdict::Intercepted);

        // Confirmation read returns the reply tag plus the bound sector.
        let mut tags = [0u8; TAG_SIZE];
        let mut block = [0u8; BLOCK_SIZE];
        let verdict = endpoint.handle_io(IoEvent {
            drive,
            sector,
            direction: Direction::Read,
            tags: &mut tags,
            block: &mut block,
        });
        assert_eq!(verdict, Verdict::Intercepted);
        assert_eq!(&block[..4], &REPLY_TAG);
        assert_eq!(u32::from_be_bytes([block[4], block[5], block[6], block[7]]), sector);
    }

    #[test]
    fn test_knock_announces_presence() {
        let mut endpoint = Endpoint::new();
        let mut last = ([0u8; TAG_SIZE], Verdict::PassThrough);
        for &probe in &KNOCK_SEQUENCE {
            last = read(&mut endpoint, 1, probe);
        }
        // The completing read still passes through to storage, but the tag
        // area carries a reply header.
        assert_eq!(last.1, Verdict::PassThrough);
        let header = Header::decode(&last.0).unwrap();
        assert_eq!(header.tag, REPLY_TAG);
        assert_eq!(header.length, 0);
    }

    #[test]
    fn test_unrelated_reads_stay_untouched() {
        let mut endpoint = Endpoint::new();
        let (tags, verdict) = read(&mut endpoint, 1, 33);
        assert_eq!(verdict, Verdict::PassThrough);
        assert_eq!(tags, [0u8; TAG_SIZE]);
    }

    #[test]
    fn test_broken_knock_resets() {
        let mut endpoint = Endpoint::new();
        read(&mut endpoint, 1, 0);
        read(&mut endpoint, 1, 70);
        read(&mut endpoint, 1, 9); // wrong probe
        let (tags, _) = read(&mut endpoint, 1, 85);
        assert_eq!(tags, [0u8; TAG_SIZE]);

        // A fresh complete knock still works afterwards.
        let mut last = ([0u8; TAG_SIZE], Verdict::PassThrough);
        for &probe in &KNOCK_SEQUENCE {
            last = read(&mut endpoint, 1, probe);
        }
        assert_eq!(Header::decode(&last.0).unwrap().tag, REPLY_TAG);
    }

    #[test]
    fn test_write_deviation_resets_knock() {
        let mut endpoint = Endpoint::new();
        read(&mut endpoint, 1, 0);
        read(&mut endpoint, 1, 70);
        // A write to an unrelated sector is a deviation too.
        write(&mut endpoint, 1, 9999, &[0u8; BLOCK_SIZE]);

        // Finishing the interrupted sequence must not announce presence.
        let mut last = ([0u8; TAG_SIZE], Verdict::PassThrough);
        for &probe in &KNOCK_SEQUENCE[2..] {
            last = read(&mut endpoint, 1, probe);
        }
        assert_eq!(last.0, [0u8; TAG_SIZE]);
    }

    #[test]
    fn test_knock_pinned_to_one_drive() {
        let mut endpoint = Endpoint::new();
        read(&mut endpoint, 1, 0);
        read(&mut endpoint, 1, 70);
        // Probe from another drive resets progress.
        let (tags, _) = read(&mut endpoint, 2, 85);
        assert_eq!(tags, [0u8; TAG_SIZE]);
    }

    #[test]
    fn test_designation_binds_sector() {
        let mut endpoint = Endpoint::new();
        negotiate(&mut endpoint, 1, 42);
        assert_eq!(endpoint.magic_sector(), Some((1, 42)));
    }

    #[test]
    fn test_non_magic_write_abandons_handshake() {
        let mut endpoint = Endpoint::new();
        for &probe in &KNOCK_SEQUENCE {
            read(&mut endpoint, 1, probe);
        }
        let verdict = write(&mut endpoint, 1, 42, &[7u8; BLOCK_SIZE]);
        assert_eq!(verdict, Verdict::PassThrough);

        // The abandoned handshake no longer accepts a designation.
        let verdict = write(&mut endpoint, 1, 42, &magic_block());
        assert_eq!(verdict, Verdict::PassThrough);
        assert_eq!(endpoint.magic_sector(), None);
    }

    #[test]
    fn test_bound_sector_carries_frames() {
        let mut endpoint = Endpoint::new();
        negotiate(&mut endpoint, 1, 42);

        let block = Frame::request(Bytes::from_static(b"payload"))
            .unwrap()
            .encode_block()
            .unwrap();
        assert_eq!(write(&mut endpoint, 1, 42, &block), Verdict::Intercepted);
        assert_eq!(endpoint.channel().take_from_host(), Bytes::from_static(b"payload"));
    }

    #[test]
    fn test_other_sectors_pass_through_after_binding() {
        let mut endpoint = Endpoint::new();
        negotiate(&mut endpoint, 1, 42);

        let (_, verdict) = read(&mut endpoint, 1, 43);
        assert_eq!(verdict, Verdict::PassThrough);
        assert_eq!(write(&mut endpoint, 1, 43, &[1u8; BLOCK_SIZE]), Verdict::PassThrough);
    }

    #[test]
    fn test_bound_sector_wrong_drive_passes_through() {
        let mut endpoint = Endpoint::new();
        negotiate(&mut endpoint, 1, 42);

        let block = Frame::request(Bytes::from_static(b"stray"))
            .unwrap()
            .encode_block()
            .unwrap();
        // Same sector number on another drive is ordinary disk traffic.
        assert_eq!(write(&mut endpoint, 2, 42, &block), Verdict::PassThrough);
        assert_eq!(endpoint.channel().pending_from_host(), 0);
    }

    #[test]
    fn test_rejected_write_on_bound_sector_passes_through() {
        let mut endpoint = Endpoint::new();
        negotiate(&mut endpoint, 1, 42);

        // No valid request header anywhere: treated as stray disk traffic.
        assert_eq!(write(&mut endpoint, 1, 42, &[0x55u8; BLOCK_SIZE]), Verdict::PassThrough);
    }

    #[test]
    fn test_reknock_does_not_regress_binding() {
        let mut endpoint = Endpoint::new();
        negotiate(&mut endpoint, 1, 42);

        let mut last = ([0u8; TAG_SIZE], Verdict::PassThrough);
        for &probe in &KNOCK_SEQUENCE {
            last = read(&mut endpoint, 1, probe);
        }
        // Presence is re-announced but the binding survives.
        assert_eq!(Header::decode(&last.0).unwrap().tag, REPLY_TAG);
        assert_eq!(endpoint.magic_sector(), Some((1, 42)));

        let block = Frame::request(Bytes::from_static(b"still here"))
            .unwrap()
            .encode_block()
            .unwrap();
        assert_eq!(write(&mut endpoint, 1, 42, &block), Verdict::Intercepted);
    }

    #[test]
    fn test_redesignation_moves_binding() {
        let mut endpoint = Endpoint::new();
        negotiate(&mut endpoint, 1, 42);

        // A restarted host designates a different sector.
        assert_eq!(write(&mut endpoint, 1, 77, &magic_block()), Verdict::Intercepted);
        assert_eq!(endpoint.magic_sector(), Some((1, 77)));

        // The old sector is ordinary storage again.
        assert_eq!(write(&mut endpoint, 1, 42, &[1u8; BLOCK_SIZE]), Verdict::PassThrough);
    }

    #[test]
    fn test_sentinel_sector_always_routed() {
        let mut endpoint = Endpoint::new();
        // No handshake at all.
        let block = Frame::request(Bytes::from_static(b"direct"))
            .unwrap()
            .encode_block()
            .unwrap();
        assert_eq!(write(&mut endpoint, 1, SENTINEL_SECTOR, &block), Verdict::Intercepted);
        assert_eq!(endpoint.channel().take_from_host(), Bytes::from_static(b"direct"));
    }

    #[test]
    fn test_sentinel_abandons_partial_knock() {
        let mut endpoint = Endpoint::new();
        read(&mut endpoint, 1, 0);
        read(&mut endpoint, 1, 70);
        read(&mut endpoint, 1, SENTINEL_SECTOR);
        // Progress was dropped; finishing the old sequence does nothing.
        let (tags, _) = read(&mut endpoint, 1, 85);
        assert_eq!(tags, [0u8; TAG_SIZE]);
    }
}
