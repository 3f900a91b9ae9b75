//! Bounded Ring Family
//!
//! Three fixed-capacity rings sharing the same insert/extract shape:
//!
//! - [`Ring`]: lock-free, compile-time capacity, exactly one producer
//!   thread and one consumer thread
//! - [`MtRing`]: the same operations inside a mutex critical section,
//!   safe for arbitrary producer/consumer counts
//! - [`DynamicRing`]: lock-free SPSC with the capacity chosen at
//!   construction; one slot stays permanently reserved so full and
//!   empty are distinguishable without extra state
//!
//! The producer side only ever advances `head`, the consumer side only
//! ever advances `tail`. Occupancy is `head - tail` for the monotonic
//! variants.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// Lock-free single-producer/single-consumer ring with compile-time
/// capacity `N` (must be a power of two).
///
/// `insert` and `extract` take `&self`; the ring is safe to share
/// across threads **only** under the contract that exactly one thread
/// inserts and exactly one thread extracts. Violating that contract is
/// a data race. The contract is not runtime-checked; callers partition
/// rings per thread to uphold it.
pub struct Ring<T, const N: usize> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
}

// Slots are only touched by the thread that owns the corresponding
// cursor, so sharing is sound under the SPSC contract.
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    /// Create an empty ring.
    pub fn new() -> Self {
        assert!(N > 0 && N.is_power_of_two(), "ring capacity must be a power of two");
        Self {
            slots: (0..N).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect(),
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Insert `value`; fails returning it iff occupancy equals `N`.
    ///
    /// Producer side only.
    #[inline]
    pub fn insert(&self, value: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) as usize >= N {
            return Err(value);
        }
        unsafe {
            (*self.slots[head as usize % N].get()).write(value);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Extract the oldest element; `None` iff the ring is empty.
    ///
    /// Consumer side only.
    #[inline]
    pub fn extract(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = unsafe { (*self.slots[tail as usize % N].get()).assume_init_read() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Current occupancy.
    #[inline]
    pub fn count(&self) -> usize {
        self.head
            .load(Ordering::Relaxed)
            .wrapping_sub(self.tail.load(Ordering::Relaxed)) as usize
    }

    /// True when nothing is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// True when occupancy reached `N`.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() >= N
    }

    /// Compile-time capacity.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        while self.extract().is_some() {}
    }
}

/// Plain bounded ring used under the [`MtRing`] lock. Monotonic usize
/// cursors; occupancy is `head - tail`.
struct Bounded<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
}

impl<T> Bounded<T> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
        }
    }

    fn insert(&mut self, value: T) -> Result<(), T> {
        if self.head - self.tail >= self.slots.len() {
            return Err(value);
        }
        let idx = self.head % self.slots.len();
        self.slots[idx] = Some(value);
        self.head += 1;
        Ok(())
    }

    fn extract(&mut self) -> Option<T> {
        if self.head == self.tail {
            return None;
        }
        let idx = self.tail % self.slots.len();
        self.tail += 1;
        self.slots[idx].take()
    }

    fn count(&self) -> usize {
        self.head - self.tail
    }
}

/// Locked ring variant: the same operations as [`Ring`] wrapped in a
/// mutex, safe for any number of producers and consumers.
///
/// The critical section covers a single insert or extract; callers
/// must not hold other long-held locks around these calls.
pub struct MtRing<T, const N: usize> {
    inner: Mutex<Bounded<T>>,
}

impl<T, const N: usize> MtRing<T, N> {
    /// Create an empty ring.
    pub fn new() -> Self {
        assert!(N > 0, "ring capacity must be nonzero");
        Self {
            inner: Mutex::new(Bounded::new(N)),
        }
    }

    /// Insert `value`; fails returning it iff the ring is full.
    #[inline]
    pub fn insert(&self, value: T) -> Result<(), T> {
        self.inner.lock().insert(value)
    }

    /// Extract the oldest element; `None` iff the ring is empty.
    #[inline]
    pub fn extract(&self) -> Option<T> {
        self.inner.lock().extract()
    }

    /// Current occupancy.
    #[inline]
    pub fn count(&self) -> usize {
        self.inner.lock().count()
    }

    /// True when nothing is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Compile-time capacity.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for MtRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free SPSC ring sized at construction.
///
/// One slot is permanently unusable: a ring built with `size` C holds
/// at most C-1 live elements. Cursors are slot indices in `[0, size)`;
/// the ring is empty when `head == tail` and full when
/// `(head + 1) % size == tail`.
///
/// Same single-producer/single-consumer contract as [`Ring`].
pub struct DynamicRing<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    size: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Sync for DynamicRing<T> {}
unsafe impl<T: Send> Send for DynamicRing<T> {}

impl<T> DynamicRing<T> {
    /// Create an empty ring of `size` slots (usable capacity
    /// `size - 1`).
    pub fn new(size: usize) -> Self {
        assert!(size >= 2, "dynamic ring needs at least two slots");
        Self {
            slots: (0..size).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect(),
            size,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Insert `value`; fails returning it iff the ring already holds
    /// `size - 1` elements.
    ///
    /// Producer side only.
    #[inline]
    pub fn insert(&self, value: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % self.size;
        if next == self.tail.load(Ordering::Acquire) {
            return Err(value);
        }
        unsafe {
            (*self.slots[head].get()).write(value);
        }
        self.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Extract the oldest element; `None` iff the ring is empty.
    ///
    /// Consumer side only.
    #[inline]
    pub fn extract(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let value = unsafe { (*self.slots[tail].get()).assume_init_read() };
        self.tail.store((tail + 1) % self.size, Ordering::Release);
        Some(value)
    }

    /// Current occupancy.
    #[inline]
    pub fn count(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        (head + self.size - tail) % self.size
    }

    /// True when nothing is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Usable capacity (`size - 1`).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size - 1
    }
}

impl<T> Drop for DynamicRing<T> {
    fn drop(&mut self) {
        let mut tail = *self.tail.get_mut();
        let head = *self.head.get_mut();
        while tail != head {
            unsafe {
                ptr::drop_in_place((*self.slots[tail].get()).as_mut_ptr());
            }
            tail = (tail + 1) % self.size;
        }
    }
}
