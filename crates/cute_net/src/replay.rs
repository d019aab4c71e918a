//! Per-connection replay protection. See [`ReplayBuffer`].

/// 256-entry direct-mapped table of recently-seen sequence numbers.
///
/// Deliberately simpler than [`cute_net_transport::SeqBuf`]: the packet
/// codec only needs a stale/duplicate check, not per-sequence payload
/// storage, so it keeps its own minimal table rather than instantiating the
/// transport crate's generic ring buffer for a single `u64` per slot.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    slots: [u64; Self::SIZE],
    head: u64,
}

/// Sentinel meaning "this slot has never recorded a sequence".
const NEVER_SEEN: u64 = u64::MAX;

impl ReplayBuffer {
    /// Number of tracked recent sequences.
    pub const SIZE: usize = 256;

    /// Creates an empty replay buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [NEVER_SEEN; Self::SIZE],
            head: 0,
        }
    }

    fn index(seq: u64) -> usize {
        usize::try_from(seq % Self::SIZE as u64).expect("fits in usize")
    }

    /// Returns `true` if `seq` is acceptable: not older than `head - 256`
    /// and not already recorded in its slot.
    #[must_use]
    pub fn check(&self, seq: u64) -> bool {
        if seq + Self::SIZE as u64 <= self.head {
            return false;
        }
        let slot = self.slots[Self::index(seq)];
        slot == NEVER_SEEN || slot < seq
    }

    /// Records `seq` as seen, raising `head` if it advances it.
    pub fn update(&mut self, seq: u64) {
        self.head = self.head.max(seq);
        self.slots[Self::index(seq)] = seq;
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_fresh_rejects_duplicate() {
        let mut buf = ReplayBuffer::new();
        assert!(buf.check(5));
        buf.update(5);
        assert!(!buf.check(5));
        assert!(buf.check(6));
    }

    #[test]
    fn rejects_stale_relative_to_head() {
        let mut buf = ReplayBuffer::new();
        buf.update(1000);
        assert!(!buf.check(1000 - ReplayBuffer::SIZE as u64));
        assert!(buf.check(1000 - ReplayBuffer::SIZE as u64 + 1));
    }

    #[test]
    fn accepts_out_of_order_within_window() {
        let mut buf = ReplayBuffer::new();
        buf.update(10);
        assert!(buf.check(3));
        buf.update(3);
        assert!(!buf.check(3));
    }
}
