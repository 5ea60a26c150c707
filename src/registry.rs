//! Parked client requests and their wake-time replay.
//!
//! When a client read or write cannot finish immediately (the staging buffer
//! is full, empty, or another task holds the transfer token), the request is
//! parked here keyed by client id. After each transfer completes, the pump
//! replays every parked request against the refreshed buffers; whatever
//! finishes resolves its oneshot, and the rest stay parked.
//!
//! One request per client id: a newcomer under the same id displaces the
//! older one, which is resolved with its partial progress so its waiter is
//! never left hanging.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tracing::warn;

use crate::buffer::ByteBuffer;

/// Final result of a parked operation.
#[derive(Debug)]
pub enum IoOutcome {
    /// Bytes accepted from a write request.
    Written(usize),
    /// Bytes delivered to a read request.
    Read(Bytes),
}

/// An in-progress byte transfer.
#[derive(Debug)]
pub enum Transfer {
    Read {
        /// Total bytes the client asked for.
        wanted: usize,
        /// Bytes collected so far.
        filled: BytesMut,
    },
    Write {
        /// Bytes the client handed over.
        data: Bytes,
        /// How many have been staged so far.
        sent: usize,
    },
}

impl Transfer {
    pub fn read(wanted: usize) -> Self {
        Self::Read {
            wanted,
            filled: BytesMut::with_capacity(wanted),
        }
    }

    pub fn write(data: Bytes) -> Self {
        Self::Write { data, sent: 0 }
    }

    /// Move as many bytes as the buffers allow; `true` when complete.
    ///
    /// Reads drain the inbound buffer, writes fill the outbound one.
    pub fn advance(&mut self, inbound: &mut ByteBuffer, outbound: &mut ByteBuffer) -> bool {
        match self {
            Self::Read { wanted, filled } => {
                let take = (*wanted - filled.len()).min(inbound.remaining());
                filled.extend_from_slice(&inbound.readable()[..take]);
                inbound.advance(take);
                filled.len() >= *wanted
            }
            Self::Write { data, sent } => {
                *sent += outbound.fill_from(&data[*sent..]);
                *sent >= data.len()
            }
        }
    }

    /// Resolve into an outcome with whatever progress was made.
    pub fn into_outcome(self) -> IoOutcome {
        match self {
            Self::Read { filled, .. } => IoOutcome::Read(filled.freeze()),
            Self::Write { sent, .. } => IoOutcome::Written(sent),
        }
    }
}

/// A parked request: the transfer plus the waiter to resolve.
#[derive(Debug)]
pub struct PendingRequest {
    pub transfer: Transfer,
    pub done: oneshot::Sender<IoOutcome>,
}

/// All currently parked requests, keyed by client id.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    parked: HashMap<u32, PendingRequest>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    /// Park a request. A request already parked under this id is displaced
    /// and resolved with its partial progress.
    pub fn park(&mut self, client: u32, request: PendingRequest) {
        if let Some(displaced) = self.parked.insert(client, request) {
            warn!(client, "displacing an earlier parked request");
            let _ = displaced.done.send(displaced.transfer.into_outcome());
        }
    }

    /// Replay every parked request against the buffers.
    ///
    /// Completed transfers resolve their waiters and leave the registry.
    /// Returns `(bytes_read, bytes_written)` moved during this replay.
    pub fn replay(&mut self, inbound: &mut ByteBuffer, outbound: &mut ByteBuffer) -> (u64, u64) {
        let mut read = 0u64;
        let mut written = 0u64;

        let ids: Vec<u32> = self.parked.keys().copied().collect();
        for id in ids {
            let Some(mut request) = self.parked.remove(&id) else {
                continue;
            };
            let before = (inbound.remaining(), outbound.remaining());
            let complete = request.transfer.advance(inbound, outbound);
            read += (before.0 - inbound.remaining()) as u64;
            written += (before.1 - outbound.remaining()) as u64;

            if complete {
                let _ = request.done.send(request.transfer.into_outcome());
            } else {
                self.parked.insert(id, request);
            }
        }
        (read, written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_PAYLOAD;

    #[test]
    fn test_write_transfer_fills_outbound() {
        let mut inbound = ByteBuffer::inbound();
        let mut outbound = ByteBuffer::outbound();

        let mut t = Transfer::write(Bytes::from_static(b"abc"));
        assert!(t.advance(&mut inbound, &mut outbound));
        assert_eq!(outbound.filled(), b"abc");
    }

    #[test]
    fn test_write_transfer_spans_buffers() {
        let mut inbound = ByteBuffer::inbound();
        let mut outbound = ByteBuffer::outbound();

        let data = Bytes::from(vec![7u8; MAX_PAYLOAD + 10]);
        let mut t = Transfer::write(data);

        // First pass fills the buffer but the transfer is not done.
        assert!(!t.advance(&mut inbound, &mut outbound));
        assert_eq!(outbound.filled().len(), MAX_PAYLOAD);

        // After the pump ships and clears, the tail fits.
        outbound.clear();
        assert!(t.advance(&mut inbound, &mut outbound));
        assert_eq!(outbound.filled().len(), 10);
    }

    #[test]
    fn test_read_transfer_drains_inbound() {
        let mut inbound = ByteBuffer::inbound();
        let mut outbound = ByteBuffer::outbound();
        inbound.load(b"stream data");

        let mut t = Transfer::read(6);
        assert!(t.advance(&mut inbound, &mut outbound));
        assert!(matches!(t.into_outcome(), IoOutcome::Read(b) if &b[..] == b"stream"));
        assert_eq!(inbound.readable(), b" data");
    }

    #[test]
    fn test_read_transfer_waits_for_more() {
        let mut inbound = ByteBuffer::inbound();
        let mut outbound = ByteBuffer::outbound();
        inbound.load(b"ab");

        let mut t = Transfer::read(5);
        assert!(!t.advance(&mut inbound, &mut outbound));

        inbound.load(b"cdef");
        assert!(t.advance(&mut inbound, &mut outbound));
        assert!(matches!(t.into_outcome(), IoOutcome::Read(b) if &b[..] == b"abcde"));
    }

    #[tokio::test]
    async fn test_replay_resolves_completed_waiters() {
        let mut registry = PendingRegistry::new();
        let mut inbound = ByteBuffer::inbound();
        let mut outbound = ByteBuffer::outbound();

        let (tx, rx) = oneshot::channel();
        registry.park(
            7,
            PendingRequest {
                transfer: Transfer::read(4),
                done: tx,
            },
        );
        assert_eq!(registry.len(), 1);

        inbound.load(b"data!");
        let (read, written) = registry.replay(&mut inbound, &mut outbound);
        assert_eq!((read, written), (4, 0));
        assert!(registry.is_empty());

        assert!(matches!(rx.await.unwrap(), IoOutcome::Read(b) if &b[..] == b"data"));
    }

    #[tokio::test]
    async fn test_replay_keeps_incomplete_requests() {
        let mut registry = PendingRegistry::new();
        let mut inbound = ByteBuffer::inbound();
        let mut outbound = ByteBuffer::outbound();

        let (tx, mut rx) = oneshot::channel();
        registry.park(
            1,
            PendingRequest {
                transfer: Transfer::read(100),
                done: tx,
            },
        );

        inbound.load(b"short");
        registry.replay(&mut inbound, &mut outbound);
        assert_eq!(registry.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_park_displaces_same_client() {
        let mut registry = PendingRegistry::new();

        let (tx1, rx1) = oneshot::channel();
        registry.park(
            3,
            PendingRequest {
                transfer: Transfer::write(Bytes::from_static(b"old")),
                done: tx1,
            },
        );

        let (tx2, _rx2) = oneshot::channel();
        registry.park(
            3,
            PendingRequest {
                transfer: Transfer::write(Bytes::from_static(b"new")),
                done: tx2,
            },
        );

        assert_eq!(registry.len(), 1);
        // The displaced waiter gets its partial progress (zero here).
        assert!(matches!(rx1.await.unwrap(), IoOutcome::Written(0)));
    }
}
