//! Lock-free single-producer single-consumer byte queue
//!
//! One side of the queue lives in interrupt context and the other in
//! foreground code, so the two indices are strictly partitioned: `push`
//! advances only `head`, `pop` advances only `tail`. With that discipline
//! the acquire/release pairs on the indices are the only synchronization
//! required; there are no critical sections on the data path.
//!
//! The capacity must be a power of two so wraparound reduces to index
//! masking. One slot is sacrificed to distinguish full from empty, leaving
//! `N - 1` usable bytes.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Fixed-capacity byte queue with a persistent drop counter
pub(crate) struct Queue<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    /// Write index, advanced only by the producer
    head: AtomicUsize,
    /// Read index, advanced only by the consumer
    tail: AtomicUsize,
    /// Bytes that could not be enqueued because the queue was full
    dropped: AtomicU32,
}

// Access is coordinated through the head/tail protocol: each buffer slot is
// written by at most one context before ownership is released through the
// matching index store.
unsafe impl<const N: usize> Sync for Queue<N> {}

impl<const N: usize> Queue<N> {
    /// Index mask. Evaluating it rejects capacities that are not powers of two.
    const MASK: usize = {
        assert!(N.is_power_of_two());
        N - 1
    };

    pub(crate) const fn new() -> Self {
        Queue {
            buf: UnsafeCell::new([0; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicU32::new(0),
        }
    }

    /// Reset the indices and the drop counter.
    ///
    /// Only sound while neither side is actively using the queue, i.e.
    /// before the owning peripheral's interrupt is enabled.
    pub(crate) fn reset(&self) {
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        self.dropped.store(0, Ordering::Release);
    }

    /// Append one byte. Returns `false`, without overwriting anything, if
    /// the queue is full.
    pub(crate) fn push(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & Self::MASK;
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }
        // NOTE(unsafe) the slot at `head` is not yet visible to the consumer
        unsafe {
            (*self.buf.get())[head] = byte;
        }
        self.head.store(next, Ordering::Release);
        true
    }

    /// Remove and return the oldest byte, or `None` if the queue is empty.
    pub(crate) fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        // NOTE(unsafe) the slot at `tail` was published by the producer's
        // release store of `head`
        let byte = unsafe { (*self.buf.get())[tail] };
        self.tail.store((tail + 1) & Self::MASK, Ordering::Release);
        Some(byte)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Record `n` bytes as lost to a full queue.
    pub(crate) fn note_dropped(&self, n: u32) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Total bytes lost to a full queue since the last reset
    pub(crate) fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let q: Queue<8> = Queue::new();
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn fifo_order() {
        let q: Queue<8> = Queue::new();
        for b in 10..15 {
            assert!(q.push(b));
        }
        for b in 10..15 {
            assert_eq!(q.pop(), Some(b));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn usable_capacity_is_size_minus_one() {
        let q: Queue<8> = Queue::new();
        for b in 0..7 {
            assert!(q.push(b));
        }
        assert!(!q.push(7));
    }

    #[test]
    fn fifo_order_across_wraparound() {
        let q: Queue<8> = Queue::new();
        // advance the indices so the next run of pushes wraps
        for b in 0..6 {
            assert!(q.push(b));
        }
        for b in 0..6 {
            assert_eq!(q.pop(), Some(b));
        }
        for b in 100..107 {
            assert!(q.push(b));
        }
        for b in 100..107 {
            assert_eq!(q.pop(), Some(b));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn interleaved_push_pop_preserves_order() {
        let q: Queue<8> = Queue::new();
        let mut expected = 0u8;
        let mut next = 0u8;
        for _ in 0..50 {
            for _ in 0..3 {
                if q.push(next) {
                    next = next.wrapping_add(1);
                }
            }
            if let Some(b) = q.pop() {
                assert_eq!(b, expected);
                expected = expected.wrapping_add(1);
            }
        }
    }

    #[test]
    fn drop_counter_accumulates() {
        let q: Queue<8> = Queue::new();
        q.note_dropped(3);
        q.note_dropped(4);
        assert_eq!(q.dropped(), 7);
        q.reset();
        assert_eq!(q.dropped(), 0);
    }
}
