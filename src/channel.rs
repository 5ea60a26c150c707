//! Magic-sector channel - frame servicing for the negotiated sector.
//!
//! Once the handshake binds a sector, every read or write addressed to it is
//! routed here instead of to storage. A write carries host bytes inbound; a
//! read drains queued peripheral bytes outbound, with the header advertising
//! the true total queued so the host knows to poll again when more than one
//! block's worth is waiting.
//!
//! A loopback mode echoes host writes straight back into the outbound queue,
//! which is how the transport is exercised without a real peripheral
//! application behind it.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::protocol::{Frame, Header, HEADER_SIZE, MAX_PAYLOAD, REQUEST_TAG};

/// Upper bound on queued loopback bytes before writes are dropped.
const LOOPBACK_CAPACITY: usize = 2000;

/// The byte queues behind the negotiated sector.
#[derive(Debug)]
pub struct SectorChannel {
    /// Bytes queued for delivery to the host (drained by sector reads).
    to_host: VecDeque<u8>,
    /// Bytes received from the host (filled by sector writes).
    from_host: VecDeque<u8>,
    /// Echo host writes back into `to_host` instead of queueing them.
    loopback: bool,
}

impl SectorChannel {
    /// Create a channel with empty queues.
    pub fn new() -> Self {
        Self {
            to_host: VecDeque::new(),
            from_host: VecDeque::new(),
            loopback: false,
        }
    }

    /// Create a channel that echoes host writes back to the host.
    pub fn loopback() -> Self {
        Self {
            loopback: true,
            ..Self::new()
        }
    }

    /// Queue bytes for delivery to the host.
    pub fn queue_to_host(&mut self, bytes: &[u8]) {
        self.to_host.extend(bytes);
    }

    /// Number of bytes currently queued for the host.
    #[inline]
    pub fn pending_to_host(&self) -> usize {
        self.to_host.len()
    }

    /// Number of bytes received from the host and not yet taken.
    #[inline]
    pub fn pending_from_host(&self) -> usize {
        self.from_host.len()
    }

    /// Take everything received from the host so far.
    pub fn take_from_host(&mut self) -> Bytes {
        Bytes::from(self.from_host.drain(..).collect::<Vec<u8>>())
    }

    /// Service a read of the bound sector: fill `block` with a reply frame.
    ///
    /// The frame payload is up to 500 queued bytes; the header advertises the
    /// total queued before draining, even when that exceeds one block.
    pub(crate) fn service_read(&mut self, block: &mut [u8]) {
        let total = self.to_host.len();
        let take = total
            .min(MAX_PAYLOAD)
            .min(block.len().saturating_sub(HEADER_SIZE));
        let payload = Bytes::from(self.to_host.drain(..take).collect::<Vec<u8>>());

        debug!(total, take, "servicing channel read");

        // take <= MAX_PAYLOAD and block holds header + take, so this
        // cannot fail.
        if let Ok(frame) = Frame::reply(payload, total) {
            let _ = frame.encode_into(block);
        }
    }

    /// Service a write to the bound sector.
    ///
    /// The header is taken from the tag area when valid, else from the first
    /// 12 bytes of the block; with a tag-area header the payload starts at
    /// block offset 0, otherwise at offset 12. Returns `false` (and forwards
    /// nothing) when neither location carries a valid request header.
    pub(crate) fn service_write(&mut self, tags: &[u8], block: &[u8]) -> bool {
        let (header, payload_offset) = match Header::decode_tagged(tags, REQUEST_TAG) {
            Some(h) => (h, 0),
            None => match Header::decode_tagged(block, REQUEST_TAG) {
                Some(h) => (h, HEADER_SIZE),
                None => {
                    warn!("write to bound sector without a valid header");
                    return false;
                }
            },
        };

        let len = (header.length as usize)
            .min(MAX_PAYLOAD)
            .min(block.len().saturating_sub(payload_offset));
        let payload = &block[payload_offset..payload_offset + len];

        debug!(len, pending = self.to_host.len(), "servicing channel write");

        if self.loopback {
            if self.to_host.len() + len <= LOOPBACK_CAPACITY {
                self.to_host.extend(payload);
            } else {
                warn!("loopback queue overflow, dropping write");
            }
        } else {
            self.from_host.extend(payload);
        }
        true
    }
}

impl Default for SectorChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BLOCK_SIZE, REPLY_TAG};

    fn write_block(payload: &[u8]) -> [u8; BLOCK_SIZE] {
        Frame::request(Bytes::copy_from_slice(payload))
            .unwrap()
            .encode_block()
            .unwrap()
    }

    #[test]
    fn test_write_header_in_block() {
        let mut channel = SectorChannel::new();
        let block = write_block(b"hello");

        assert!(channel.service_write(&[0u8; 20], &block));
        assert_eq!(channel.take_from_host(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_write_header_in_tags_payload_at_offset_zero() {
        let mut channel = SectorChannel::new();

        // Header in the tag area: the whole block is payload.
        let tags = Header::request(5).encode();
        let mut block = [0u8; BLOCK_SIZE];
        block[..5].copy_from_slice(b"hello");

        assert!(channel.service_write(&tags, &block));
        assert_eq!(channel.take_from_host(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_tag_area_takes_precedence() {
        let mut channel = SectorChannel::new();

        // Valid headers in both places; the tag-area one (length 2) wins,
        // so payload comes from block offset 0.
        let tags = Header::request(2).encode();
        let block = write_block(b"xyz");

        assert!(channel.service_write(&tags, &block));
        let got = channel.take_from_host();
        assert_eq!(got.len(), 2);
        assert_eq!(&got[..], &block[..2]);
    }

    #[test]
    fn test_write_without_header_rejected() {
        let mut channel = SectorChannel::new();
        let block = [0xABu8; BLOCK_SIZE];

        assert!(!channel.service_write(&[0u8; 20], &block));
        assert_eq!(channel.pending_from_host(), 0);
    }

    #[test]
    fn test_write_with_reply_tag_rejected() {
        // A reply-tagged block is not a valid host write.
        let mut channel = SectorChannel::new();
        let block = Frame::reply(Bytes::from_static(b"no"), 2)
            .unwrap()
            .encode_block()
            .unwrap();

        assert!(!channel.service_write(&[0u8; 20], &block));
    }

    #[test]
    fn test_read_drains_and_advertises_total() {
        let mut channel = SectorChannel::new();
        channel.queue_to_host(&[7u8; 8]);

        let mut block = [0u8; BLOCK_SIZE];
        channel.service_read(&mut block);

        let frame = Frame::decode_block(&block, REPLY_TAG).unwrap();
        assert_eq!(frame.advertised_len(), 8);
        assert_eq!(frame.payload(), &[7u8; 8]);
        assert_eq!(channel.pending_to_host(), 0);
    }

    #[test]
    fn test_read_advertises_overflow_total() {
        let mut channel = SectorChannel::new();
        channel.queue_to_host(&vec![1u8; 1300]);

        let mut block = [0u8; BLOCK_SIZE];
        channel.service_read(&mut block);

        let frame = Frame::decode_block(&block, REPLY_TAG).unwrap();
        assert_eq!(frame.advertised_len(), 1300);
        assert_eq!(frame.payload_len(), MAX_PAYLOAD);
        assert!(frame.more_pending());

        // The excess stays queued for the next poll.
        assert_eq!(channel.pending_to_host(), 800);
    }

    #[test]
    fn test_read_empty_queue() {
        let mut channel = SectorChannel::new();
        let mut block = [0xFFu8; BLOCK_SIZE];
        channel.service_read(&mut block);

        let frame = Frame::decode_block(&block, REPLY_TAG).unwrap();
        assert_eq!(frame.advertised_len(), 0);
        assert_eq!(frame.payload_len(), 0);
    }

    #[test]
    fn test_loopback_echo() {
        let mut channel = SectorChannel::loopback();
        let block = write_block(b"echo me");

        assert!(channel.service_write(&[0u8; 20], &block));
        assert_eq!(channel.pending_from_host(), 0);
        assert_eq!(channel.pending_to_host(), 7);

        let mut out = [0u8; BLOCK_SIZE];
        channel.service_read(&mut out);
        let frame = Frame::decode_block(&out, REPLY_TAG).unwrap();
        assert_eq!(frame.payload(), b"echo me");
    }

    #[test]
    fn test_loopback_overflow_dropped() {
        let mut channel = SectorChannel::loopback();
        let block = write_block(&[2u8; MAX_PAYLOAD]);
        for _ in 0..4 {
            channel.service_write(&[0u8; 20], &block);
        }
        // Four full writes exactly fill the cap.
        assert_eq!(channel.pending_to_host(), 2000);

        // A fifth would overflow; it is still a valid channel write, but
        // its payload is dropped.
        assert!(channel.service_write(&[0u8; 20], &block));
        assert_eq!(channel.pending_to_host(), 2000);
    }
}
