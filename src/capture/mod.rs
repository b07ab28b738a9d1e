//! Frame transports
//!
//! A transport delivers complete inbound frames one per poll and accepts
//! outbound frames as contiguous byte ranges. All I/O is non-blocking; the
//! poll loop never parks.

mod af_packet;

pub use af_packet::AfPacketSocket;

use crate::Result;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Frame I/O for one interface
pub trait Transport {
    /// Queue one frame for transmission. The transport delivers the byte
    /// range atomically as a single frame.
    fn transmit(&mut self, frame: &[u8]) -> Result<()>;

    /// Non-blocking receive of at most one frame into `buf`.
    ///
    /// `Ok(None)` means no data is pending; errors are fatal receive
    /// failures.
    fn poll(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;
}

/// In-memory transport for tests.
///
/// Clones share the same queues: keep one clone to inject inbound frames
/// and inspect transmissions, hand the other to the router.
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    inbound: Rc<RefCell<VecDeque<Vec<u8>>>>,
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for the next poll
    pub fn inject(&self, frame: &[u8]) {
        self.inbound.borrow_mut().push_back(frame.to_vec());
    }

    /// Snapshot of every transmitted frame
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.borrow().clone()
    }

    /// Drain the transmitted frames
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }
}

impl Transport for MockTransport {
    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        self.sent.borrow_mut().push(frame.to_vec());
        Ok(())
    }

    fn poll(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.inbound.borrow_mut().pop_front() {
            Some(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(len))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_transport_poll_order() {
        let handle = MockTransport::new();
        let mut transport = handle.clone();

        handle.inject(&[1, 2, 3]);
        handle.inject(&[4, 5]);

        let mut buf = [0u8; 16];
        assert_eq!(transport.poll(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(transport.poll(&mut buf).unwrap(), Some(2));
        assert_eq!(transport.poll(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_mock_transport_records_sent() {
        let handle = MockTransport::new();
        let mut transport = handle.clone();

        transport.transmit(&[0xde, 0xad]).unwrap();
        assert_eq!(handle.sent(), vec![vec![0xde, 0xad]]);
        assert_eq!(handle.take_sent().len(), 1);
        assert!(handle.sent().is_empty());
    }
}
