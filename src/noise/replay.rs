//! Sliding-window replay filter for transport counters.

use super::REPLAY_WINDOW_SIZE;

const BLOCK_BITS: u64 = 64;
const BLOCK_BIT_LOG: u64 = 6;
const RING_BLOCKS: u64 = (REPLAY_WINDOW_SIZE as u64) / BLOCK_BITS;
const BLOCK_MASK: u64 = RING_BLOCKS - 1;
const BIT_MASK: u64 = BLOCK_BITS - 1;
/// One block of the ring is always being recycled.
const WINDOW_SIZE: u64 = (RING_BLOCKS - 1) * BLOCK_BITS;

/// Ring-of-bitmaps replay window (RFC 6479 style).
#[derive(Clone, Debug)]
pub struct ReplayWindow {
    last: u64,
    ring: [u64; RING_BLOCKS as usize],
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            last: 0,
            ring: [0u64; RING_BLOCKS as usize],
        }
    }

    /// Accept `counter` if it is below `limit`, inside the window and not
    /// seen before; records it on acceptance.
    pub fn check_and_update(&mut self, counter: u64, limit: u64) -> bool {
        if counter >= limit {
            return false;
        }
        let mut index_block = counter >> BLOCK_BIT_LOG;
        if counter > self.last {
            let current = self.last >> BLOCK_BIT_LOG;
            let diff = (index_block - current).min(RING_BLOCKS);
            for i in current + 1..=current + diff {
                self.ring[(i & BLOCK_MASK) as usize] = 0;
            }
            self.last = counter;
        } else if self.last - counter > WINDOW_SIZE {
            return false;
        }

        index_block &= BLOCK_MASK;
        let bit = 1u64 << (counter & BIT_MASK);
        let old = self.ring[index_block as usize];
        self.ring[index_block as usize] = old | bit;
        old & bit == 0
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = u64::MAX;

    #[test]
    fn test_sequential_accepted_once() {
        let mut w = ReplayWindow::new();
        for n in 0..100 {
            assert!(w.check_and_update(n, LIMIT));
        }
        for n in 0..100 {
            assert!(!w.check_and_update(n, LIMIT));
        }
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut w = ReplayWindow::new();
        assert!(w.check_and_update(10, LIMIT));
        assert!(w.check_and_update(5, LIMIT));
        assert!(w.check_and_update(7, LIMIT));
        assert!(!w.check_and_update(5, LIMIT));
    }

    #[test]
    fn test_too_old_rejected() {
        let mut w = ReplayWindow::new();
        assert!(w.check_and_update(WINDOW_SIZE + 10, LIMIT));
        assert!(!w.check_and_update(1, LIMIT));
        assert!(w.check_and_update(WINDOW_SIZE, LIMIT));
    }

    #[test]
    fn test_large_jump_clears_ring() {
        let mut w = ReplayWindow::new();
        assert!(w.check_and_update(3, LIMIT));
        assert!(w.check_and_update(1_000_000, LIMIT));
        assert!(w.check_and_update(1_000_000 - 64, LIMIT));
        assert!(!w.check_and_update(1_000_000, LIMIT));
    }

    #[test]
    fn test_limit_enforced() {
        let mut w = ReplayWindow::new();
        assert!(!w.check_and_update(50, 50));
        assert!(w.check_and_update(49, 50));
    }
}
