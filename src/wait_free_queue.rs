//! A wait-free queue for unidirectional communication between two threads.
//!
//! Implemented as a lockless circular ring buffer with the following properties:
//!
//! * at most one thread acts as the producer, at most one as the consumer - the
//!   [`split`](WaitFreeQueue::split) handles enforce this statically
//! * no locks, no spin-waits, no memory allocation after construction
//! * the capacity is a power of two fixed at construction; one slot stays unused, so a
//!   queue built for `C` elements holds at most `C - 1`
//!
//! Index publication uses release stores, observation uses acquire loads: the producer
//!  writes the slot before publishing `tail`, the consumer reads the slot before
//!  publishing `head`, and each index is written by exactly one side.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

pub struct WaitFreeQueue<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// index of the next slot the consumer will read; written only by the consumer
    head: AtomicUsize,
    /// index one past the last slot the producer wrote; written only by the producer
    tail: AtomicUsize,
}

unsafe impl<T: Send> Send for WaitFreeQueue<T> {}
unsafe impl<T: Send> Sync for WaitFreeQueue<T> {}

impl<T> WaitFreeQueue<T> {
    /// `capacity` must be a power of two > 2. The queue stores at most `capacity - 1`
    ///  elements.
    pub fn new(capacity: usize) -> WaitFreeQueue<T> {
        assert!(capacity.is_power_of_two() && capacity > 2, "capacity must be a power of two > 2, was {}", capacity);

        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(UnsafeCell::new(MaybeUninit::uninit()));
        }

        WaitFreeQueue {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// The maximum number of elements the queue can hold.
    pub fn capacity(&self) -> usize {
        self.mask
    }

    /// The number of elements currently in the queue. Callable from either side; the
    ///  value is naturally a snapshot.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side: insert at the tail. Returns the value if the queue is full.
    pub(crate) fn insert(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next_tail = (tail + 1) & self.mask;
        if next_tail == self.head.load(Ordering::Acquire) {
            return Err(value);
        }

        unsafe {
            (*self.slots[tail].get()).write(value);
        }
        self.tail.store(next_tail, Ordering::Release);
        Ok(())
    }

    /// Consumer side: take the front element.
    pub(crate) fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        let value = unsafe { (*self.slots[head].get()).assume_init_read() };
        self.head.store((head + 1) & self.mask, Ordering::Release);
        Some(value)
    }

    /// Consumer side: peek at the front element without removing it.
    pub(crate) fn front(&self) -> Option<&T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        Some(unsafe { (*self.slots[head].get()).assume_init_ref() })
    }

    /// Re-allocates the queue to twice the current size, keeping all elements.
    ///
    /// This is not concurrent: `&mut self` guarantees neither side is accessing the
    ///  queue. Concurrent growth is provided one level up by [`growable_ring`].
    pub fn resize_double(&mut self) {
        let old_capacity = self.mask + 1;
        let new_capacity = old_capacity * 2;

        let mut slots = Vec::with_capacity(new_capacity);
        for _ in 0..new_capacity {
            slots.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        let slots = slots.into_boxed_slice();

        let mut new_tail = 0;
        while let Some(value) = self.pop() {
            unsafe {
                (*slots[new_tail].get()).write(value);
            }
            new_tail += 1;
        }

        self.slots = slots;
        self.mask = new_capacity - 1;
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(new_tail, Ordering::Relaxed);
    }

    /// Splits the queue into its two single-owner endpoints.
    pub fn split(self) -> (RingProducer<T>, RingConsumer<T>) {
        let shared = Arc::new(self);
        (
            RingProducer { queue: shared.clone() },
            RingConsumer { queue: shared },
        )
    }
}

impl<T> Drop for WaitFreeQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

/// The single producer endpoint of a [`WaitFreeQueue`].
pub struct RingProducer<T> {
    queue: Arc<WaitFreeQueue<T>>,
}

impl<T: Send> RingProducer<T> {
    /// Returns the value if the queue is full.
    pub fn insert(&mut self, value: T) -> Result<(), T> {
        self.queue.insert(value)
    }

    pub fn capacity_left(&self) -> usize {
        self.queue.capacity() - self.queue.len()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The single consumer endpoint of a [`WaitFreeQueue`].
pub struct RingConsumer<T> {
    queue: Arc<WaitFreeQueue<T>>,
}

impl<T: Send> RingConsumer<T> {
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop()
    }

    pub fn front(&mut self) -> Option<&T> {
        self.queue.front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A ring that grows on producer-side overflow instead of failing.
///
/// Growth never resizes in place: the producer chains a fresh ring of twice the
///  capacity onto the full one through a write-once link and moves there permanently.
///  The consumer drains the old ring dry, follows the link, and continues. FIFO order
///  is preserved because the producer never writes a ring it has moved past, and the
///  hot path stays wait-free in both directions.
pub mod growable_ring {
    use super::*;

    struct RingNode<T> {
        ring: WaitFreeQueue<T>,
        next: OnceLock<Arc<RingNode<T>>>,
    }

    pub fn new<T: Send>(capacity: usize) -> (GrowProducer<T>, GrowConsumer<T>) {
        let node = Arc::new(RingNode {
            ring: WaitFreeQueue::new(capacity),
            next: OnceLock::new(),
        });
        (
            GrowProducer { node: node.clone() },
            GrowConsumer { node },
        )
    }

    pub struct GrowProducer<T> {
        node: Arc<RingNode<T>>,
    }

    impl<T: Send> GrowProducer<T> {
        pub fn insert(&mut self, value: T) {
            match self.node.ring.insert(value) {
                Ok(()) => {}
                Err(value) => {
                    let capacity = (self.node.ring.capacity() + 1) * 2;
                    let next = Arc::new(RingNode {
                        ring: WaitFreeQueue::new(capacity),
                        next: OnceLock::new(),
                    });
                    next.ring
                        .insert(value)
                        .unwrap_or_else(|_| unreachable!("freshly created ring cannot be full"));

                    // only the producer ever sets the link, so this cannot fail
                    let _ = self.node.next.set(next.clone());
                    self.node = next;
                }
            }
        }
    }

    pub struct GrowConsumer<T> {
        node: Arc<RingNode<T>>,
    }

    impl<T: Send> GrowConsumer<T> {
        pub fn pop(&mut self) -> Option<T> {
            loop {
                if let Some(value) = self.node.ring.pop() {
                    return Some(value);
                }

                match self.node.next.get() {
                    None => return None,
                    Some(next) => {
                        // re-check: the producer's final inserts into the old ring
                        //  happen-before it publishes the link
                        if let Some(value) = self.node.ring.pop() {
                            return Some(value);
                        }
                        self.node = next.clone();
                    }
                }
            }
        }
    }
}
