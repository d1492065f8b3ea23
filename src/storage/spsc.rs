use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A lock-free single-producer/single-consumer ring.
///
/// This is the hand-off channel between a driver's receive path and the
/// stack-manager task: `try_push` runs on the producer side with interrupt
/// latency constraints (no locks, no allocation, bounded time), `pop` on
/// the single consumer task. Capacity is rounded up to a power of two so
/// index arithmetic is a mask.
///
/// The head and tail indices are free-running; `head == tail` means empty,
/// `head - tail == capacity` means full.
pub struct SpscRing<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Next slot the producer will write.
    head: AtomicUsize,
    /// Next slot the consumer will read.
    tail: AtomicUsize,
}

// Slots are only touched by the owning side: the producer writes slots in
// [tail, head), the consumer reads slots it observed via an Acquire load of
// head. T crossing threads requires Send.
unsafe impl<T: Send> Sync for SpscRing<T> {}
unsafe impl<T: Send> Send for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// Create a ring with at least `capacity` slots.
    pub fn new(capacity: usize) -> SpscRing<T> {
        let capacity = capacity.next_power_of_two().max(2);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        SpscRing {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.head
            .load(Ordering::Acquire)
            .wrapping_sub(self.tail.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side. Hands the value back when the ring is full.
    ///
    /// Must only be called from one thread at a time.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) == self.capacity() {
            return Err(value);
        }
        unsafe {
            (*self.slots[head & self.mask].get()).write(value);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side. Must only be called from one thread at a time.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = unsafe { (*self.slots[tail & self.mask].get()).assume_init_read() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        let mut tail = *self.tail.get_mut();
        let head = *self.head.get_mut();
        while tail != head {
            unsafe {
                (*self.slots[tail & self.mask].get()).assume_init_drop();
            }
            tail = tail.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn capacity_rounds_up() {
        let ring: SpscRing<u8> = SpscRing::new(5);
        assert_eq!(ring.capacity(), 8);
    }

    #[test]
    fn full_hands_value_back() {
        let ring: SpscRing<u32> = SpscRing::new(2);
        ring.try_push(1).unwrap();
        ring.try_push(2).unwrap();
        assert_eq!(ring.try_push(3), Err(3));
        assert_eq!(ring.pop(), Some(1));
        ring.try_push(3).unwrap();
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn cross_thread_order_is_preserved() {
        let ring: Arc<SpscRing<u32>> = Arc::new(SpscRing::new(16));
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    loop {
                        if ring.try_push(i).is_ok() {
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0u32;
        while expected < 10_000 {
            if let Some(got) = ring.pop() {
                assert_eq!(got, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn pending_items_are_dropped_with_ring() {
        let ring: SpscRing<Arc<u32>> = SpscRing::new(4);
        let value = Arc::new(7u32);
        ring.try_push(value.clone()).unwrap();
        assert_eq!(Arc::strong_count(&value), 2);
        drop(ring);
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
