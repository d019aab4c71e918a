//! Per-connection state for one of the two logical channels (reliable
//! in-order, or fire-and-forget) a [`crate::transport::Transport`] exposes.

use std::collections::VecDeque;

use crate::frag::Reassembler;

/// Default reassembly window, in reassembly sequences, before an entry is
/// considered stale and dropped. Mirrors [`crate::ack::BUFFER_SIZE`]: both
/// describe "how far behind the head can a sequence fall before we give up
/// on it".
pub const REASSEMBLY_WINDOW: usize = 256;

/// Inbound half of a lane: reassembles fragments and queues completed
/// messages for the caller to pop.
pub struct InboundLane {
    reassembler: Reassembler<REASSEMBLY_WINDOW>,
    ready: VecDeque<Vec<u8>>,
}

impl Default for InboundLane {
    fn default() -> Self {
        Self {
            reassembler: Reassembler::new(),
            ready: VecDeque::new(),
        }
    }
}

impl InboundLane {
    /// Creates an empty inbound lane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrows the reassembler so the transport can feed it fragments.
    pub fn reassembler_mut(&mut self) -> &mut Reassembler<REASSEMBLY_WINDOW> {
        &mut self.reassembler
    }

    /// Queues a fully reassembled message for delivery.
    pub fn push_ready(&mut self, bytes: Vec<u8>) {
        self.ready.push_back(bytes);
    }

    /// Pops the next message ready for delivery to the caller, if any.
    pub fn pop_ready(&mut self) -> Option<Vec<u8>> {
        self.ready.pop_front()
    }
}

/// An outgoing reliable message, split into fragments, partially sent and
/// partially acked.
pub(crate) struct ReliableSendItem {
    pub fragments: Vec<Vec<u8>>,
    pub next_unsent: u16,
    pub acked_count: u16,
}

impl ReliableSendItem {
    pub(crate) fn new(fragments: Vec<Vec<u8>>) -> Self {
        Self {
            fragments,
            next_unsent: 0,
            acked_count: 0,
        }
    }

    pub(crate) fn fragment_count(&self) -> u16 {
        #[expect(clippy::cast_possible_truncation, reason = "bounded by split()")]
        {
            self.fragments.len() as u16
        }
    }

    pub(crate) fn is_fully_sent(&self) -> bool {
        usize::from(self.next_unsent) >= self.fragments.len()
    }

    pub(crate) fn is_delivered(&self) -> bool {
        self.acked_count >= self.fragment_count()
    }
}

/// Error returned by [`crate::transport::Transport::send`] when the reliable
/// send queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("reliable send queue is full (capacity {capacity})")]
pub struct SendQueueFull {
    /// Configured queue capacity.
    pub capacity: usize,
}

/// Bounded FIFO of in-flight reliable messages.
pub(crate) struct SendQueue {
    items: VecDeque<ReliableSendItem>,
    capacity: usize,
}

impl SendQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, item: ReliableSendItem) -> Result<(), SendQueueFull> {
        if self.items.len() >= self.capacity {
            return Err(SendQueueFull {
                capacity: self.capacity,
            });
        }
        self.items.push_back(item);
        Ok(())
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut ReliableSendItem> {
        self.items.front_mut()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut ReliableSendItem> {
        self.items.get_mut(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Drops every item at the front of the queue that has been fully
    /// acked, so the next partially-sent item becomes reachable again.
    pub(crate) fn drain_delivered(&mut self) {
        while matches!(self.items.front(), Some(item) if item.is_delivered()) {
            self.items.pop_front();
        }
    }
}
