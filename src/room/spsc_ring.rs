use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// Lock-free single-producer/single-consumer FIFO of fixed-size POD blocks.
///
/// Head and tail are monotonically increasing counters masked into a
/// power-of-two slot array; they are cache-padded so producer and consumer
/// do not share a line. The producer acquire-loads the consumer index and
/// release-stores its own, and symmetrically for the consumer.
///
/// Safety contract: exactly one thread calls `push` and exactly one thread
/// calls `pop`. Nothing else is required of the callers.
pub struct SpscRing<T> {
    slots: Box<[UnsafeCell<T>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T: Copy> SpscRing<T> {
    /// `capacity` must be a power of two >= 2; `fill` seeds the slot storage.
    pub fn new(capacity: usize, fill: T) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= 2,
            "SpscRing capacity must be a power of two >= 2"
        );
        let slots: Vec<UnsafeCell<T>> = (0..capacity).map(|_| UnsafeCell::new(fill)).collect();
        SpscRing {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// producer side; false when the ring is full
    pub fn push(&self, value: T) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) > self.mask {
            return false;
        }
        unsafe {
            *self.slots[head & self.mask].get() = value;
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// consumer side; None when the ring is empty
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let value = unsafe { *self.slots[tail & self.mask].get() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// TEST TEST TEST
#[cfg(test)]
mod tests {
    // Note this useful idiom: importing names from outer (for mod tests) scope.
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order_and_capacity() {
        let ring = SpscRing::new(4, 0i32);
        assert!(ring.is_empty());

        assert!(ring.push(1));
        assert!(ring.push(2));
        assert!(ring.push(3));
        assert!(ring.push(4));
        assert!(!ring.push(5), "full ring must refuse");
        assert_eq!(ring.len(), 4);

        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert!(ring.push(5));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), Some(4));
        assert_eq!(ring.pop(), Some(5));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_wraparound_many_times() {
        let ring = SpscRing::new(8, 0u64);
        for round in 0..1000u64 {
            assert!(ring.push(round));
            assert_eq!(ring.pop(), Some(round));
        }
        assert!(ring.is_empty());
    }

    #[test]
    #[should_panic]
    fn test_non_power_of_two_capacity_panics() {
        let _ = SpscRing::new(6, 0u8);
    }

    #[test]
    fn test_cross_thread_transfer() {
        let ring = Arc::new(SpscRing::new(64, 0u32));
        let producer_ring = Arc::clone(&ring);

        let producer = std::thread::spawn(move || {
            let mut next = 0u32;
            while next < 10_000 {
                if producer_ring.push(next) {
                    next += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0u32;
        while expected < 10_000 {
            if let Some(v) = ring.pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().expect("producer thread");
    }
}
