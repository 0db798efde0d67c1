//! Bounded lock-free MPMC ring queue.
//!
//! `head` is the producer index and `tail` the consumer index. Each index packs
//! a lap counter above a slot index: the low bits address the slot array and
//! the high bits count laps in steps of `one_lap`, the smallest power of two
//! above the capacity. Every slot carries a stamp in the same encoding, so a
//! consumer never reads a slot whose producer has claimed it but not finished
//! writing, and a full slot is never mistaken for one free for the next lap.

use std::{
    cell::UnsafeCell,
    fmt,
    mem::MaybeUninit,
    sync::atomic::{self, AtomicUsize, Ordering},
};

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::{ErrorKind, Result};

struct Slot<T> {
    /// Writable when equal to the producer index, readable at producer index + 1
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity multi-producer multi-consumer FIFO.
pub struct RingQueue<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    buffer: Box<[Slot<T>]>,
    capacity: usize,
    one_lap: usize,
}

unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Creates a queue holding up to `capacity` elements.
    ///
    /// `capacity` must be a non-zero power of two.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(ErrorKind::InvalidParameter("queue capacity must be a power of two"));
        }
        let buffer = (0..capacity)
            .map(|i| Slot { stamp: AtomicUsize::new(i), value: UnsafeCell::new(MaybeUninit::uninit()) })
            .collect();

        Ok(Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            buffer,
            capacity,
            one_lap: (capacity + 1).next_power_of_two(),
        })
    }

    /// Index following `pos`, rolling into the next lap after the last slot.
    fn advance(&self, pos: usize) -> usize {
        let index = pos & (self.one_lap - 1);
        if index + 1 < self.capacity {
            pos + 1
        } else {
            (pos & !(self.one_lap - 1)).wrapping_add(self.one_lap)
        }
    }

    /// Appends `value`, handing it back if the queue is full.
    pub fn enqueue(&self, value: T) -> std::result::Result<(), T> {
        let backoff = Backoff::new();
        let mut pos = self.head.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[pos & (self.one_lap - 1)];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == pos {
                match self.head.compare_exchange_weak(
                    pos,
                    self.advance(pos),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS gave this thread exclusive ownership of the slot
                        // until the stamp is published below.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.stamp.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => {
                        pos = current;
                        backoff.spin();
                    }
                }
            } else if stamp.wrapping_add(self.one_lap) == pos + 1 {
                // Slot still holds last lap's element: full unless a consumer moved on.
                atomic::fence(Ordering::SeqCst);
                let tail = self.tail.load(Ordering::Relaxed);
                if tail.wrapping_add(self.one_lap) == pos {
                    return Err(value);
                }
                backoff.spin();
                pos = self.head.load(Ordering::Relaxed);
            } else {
                backoff.snooze();
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Removes the oldest element, or returns `None` if the queue is empty.
    pub fn dequeue(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut pos = self.tail.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[pos & (self.one_lap - 1)];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == pos + 1 {
                match self.tail.compare_exchange_weak(
                    pos,
                    self.advance(pos),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the stamp proves the producer finished writing and the CAS
                        // gave this thread exclusive ownership of the value.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.stamp.store(pos.wrapping_add(self.one_lap), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => {
                        pos = current;
                        backoff.spin();
                    }
                }
            } else if stamp == pos {
                // Slot not yet written this lap: empty unless a producer claimed it.
                atomic::fence(Ordering::SeqCst);
                let head = self.head.load(Ordering::Relaxed);
                if head == pos {
                    return None;
                }
                backoff.spin();
                pos = self.tail.load(Ordering::Relaxed);
            } else {
                backoff.snooze();
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Returns the oldest element without removing it.
    pub fn peek(&mut self) -> Option<&T> {
        let pos = *self.tail.get_mut();
        let slot = &self.buffer[pos & (self.one_lap - 1)];
        if slot.stamp.load(Ordering::Acquire) != pos + 1 {
            return None;
        }
        // SAFETY: exclusive access, and the stamp marks the slot as initialised.
        Some(unsafe { (*slot.value.get()).assume_init_ref() })
    }

    /// Drops every queued element and rewinds both indices.
    pub fn clear(&mut self) {
        while self.dequeue().is_some() {}
        *self.head.get_mut() = 0;
        *self.tail.get_mut() = 0;
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            *slot.stamp.get_mut() = i;
        }
    }

    /// Returns the number of queued elements.
    pub fn len(&self) -> usize {
        loop {
            let head = self.head.load(Ordering::SeqCst);
            let tail = self.tail.load(Ordering::SeqCst);
            // Retry if a producer moved between the two loads.
            if self.head.load(Ordering::SeqCst) != head {
                continue;
            }
            let produced = head & (self.one_lap - 1);
            let consumed = tail & (self.one_lap - 1);
            return if produced > consumed {
                produced - consumed
            } else if produced < consumed {
                self.capacity - consumed + produced
            } else if head == tail {
                0
            } else {
                self.capacity
            };
        }
    }

    /// Returns the maximum number of elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if the queue holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Enqueues `value`, mapping saturation to [`ErrorKind::QueueFull`].
    pub fn try_push(&self, value: T) -> Result<()> {
        self.enqueue(value).map_err(|_| ErrorKind::QueueFull)
    }

    /// Dequeues a value, mapping an empty queue to [`ErrorKind::QueueEmpty`].
    pub fn try_pop(&self) -> Result<T> {
        self.dequeue().ok_or(ErrorKind::QueueEmpty)
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

impl<T> fmt::Debug for RingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
