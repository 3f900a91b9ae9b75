//! Buffer Arena and Free-List Pool
//!
//! Pre-allocated region of fixed-size packet buffers whose slot
//! indices are exchanged with hardware descriptor rings. One arena is
//! constructed per device and injected into the adapters that use it;
//! there is no ambient global pool.
//!
//! # Ownership invariant
//!
//! Every buffer index is held by exactly one party at any time: the
//! free list, a [`PoolBuf`] lease, or a descriptor slot. Index 0 is
//! reserved as the "no buffer" sentinel and never circulates. A leased
//! buffer is returned exactly once, either by handing it to hardware
//! (detaching the lease) or by dropping the lease.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Arc;

use parking_lot::Mutex;

/// Sentinel index meaning "no buffer". Never handed out by the pool.
pub const NO_BUF: u32 = 0;

/// Cache line size; buffers are aligned to it.
const CACHE_LINE: usize = 64;

/// Fixed-size buffer region plus the free list of its slot indices.
pub struct BufferArena {
    base: NonNull<u8>,
    layout: Layout,
    buf_size: usize,
    nbufs: usize,
    free: Mutex<Vec<u32>>,
}

// The region itself is plain bytes; access is serialized by the
// exclusive-ownership invariant on indices, and the free list by its
// mutex.
unsafe impl Send for BufferArena {}
unsafe impl Sync for BufferArena {}

impl BufferArena {
    /// Allocate an arena of `nbufs` buffers of `buf_size` bytes each.
    /// Buffer 0 is reserved; indices `1..nbufs` start on the free
    /// list.
    pub fn new(nbufs: usize, buf_size: usize) -> Arc<Self> {
        assert!(nbufs >= 2, "arena needs at least one usable buffer");
        assert!(buf_size > 0, "buffer size must be nonzero");

        let layout = Layout::from_size_align(nbufs * buf_size, CACHE_LINE)
            .expect("arena layout");
        let base = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(layout);
        };

        let free: Vec<u32> = (1..nbufs as u32).rev().collect();

        Arc::new(Self {
            base,
            layout,
            buf_size,
            nbufs,
            free: Mutex::new(free),
        })
    }

    /// Take a free buffer index; `None` when the pool is exhausted.
    #[inline]
    pub fn extract(&self) -> Option<u32> {
        self.free.lock().pop()
    }

    /// Return a buffer index to the pool.
    #[inline]
    pub fn insert(&self, idx: u32) {
        debug_assert!(idx != NO_BUF && (idx as usize) < self.nbufs);
        self.free.lock().push(idx);
    }

    /// Number of buffers currently on the free list.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Size of each buffer in bytes.
    #[inline]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Total buffer count, including the reserved index 0.
    #[inline]
    pub fn nbufs(&self) -> usize {
        self.nbufs
    }

    /// Raw view of buffer `idx`.
    ///
    /// # Safety
    ///
    /// The caller must hold ownership of `idx` (a lease or a
    /// descriptor slot) and no mutable view of the same buffer may be
    /// live.
    #[inline]
    pub unsafe fn buf(&self, idx: u32) -> &[u8] {
        debug_assert!((idx as usize) < self.nbufs);
        slice::from_raw_parts(
            self.base.as_ptr().add(idx as usize * self.buf_size),
            self.buf_size,
        )
    }

    /// Raw mutable view of buffer `idx`.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive ownership of `idx`; no other
    /// view of the same buffer may be live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn buf_mut(&self, idx: u32) -> &mut [u8] {
        debug_assert!((idx as usize) < self.nbufs);
        slice::from_raw_parts_mut(
            self.base.as_ptr().add(idx as usize * self.buf_size),
            self.buf_size,
        )
    }

    /// Lease a buffer from the pool as an owning handle.
    pub fn lease(self: &Arc<Self>) -> Option<PoolBuf> {
        self.extract().map(|idx| PoolBuf {
            arena: self.clone(),
            idx,
        })
    }
}

impl Drop for BufferArena {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.base.as_ptr(), self.layout);
        }
    }
}

/// Owning lease of one arena buffer. Dropping the lease returns the
/// buffer to the pool; [`PoolBuf::detach`] hands the index over
/// (to a descriptor slot) without returning it.
pub struct PoolBuf {
    arena: Arc<BufferArena>,
    idx: u32,
}

impl PoolBuf {
    /// Adopt ownership of `idx`, previously held by a descriptor slot.
    pub fn adopt(arena: Arc<BufferArena>, idx: u32) -> Self {
        debug_assert!(idx != NO_BUF);
        Self { arena, idx }
    }

    /// The leased buffer index.
    #[inline]
    pub fn index(&self) -> u32 {
        self.idx
    }

    /// The arena this lease belongs to.
    #[inline]
    pub fn arena(&self) -> &Arc<BufferArena> {
        &self.arena
    }

    /// First `len` bytes of the buffer (clamped to the buffer size).
    #[inline]
    pub fn bytes(&self, len: usize) -> &[u8] {
        let n = len.min(self.arena.buf_size);
        // Sound: the lease owns this index exclusively.
        unsafe { &self.arena.buf(self.idx)[..n] }
    }

    /// Mutable view of the first `len` bytes.
    #[inline]
    pub fn bytes_mut(&mut self, len: usize) -> &mut [u8] {
        let n = len.min(self.arena.buf_size);
        unsafe { &mut self.arena.buf_mut(self.idx)[..n] }
    }

    /// Give up the lease without returning the buffer to the pool.
    /// The caller (a descriptor slot) becomes the owner of the index.
    pub fn detach(self) -> u32 {
        let this = ManuallyDrop::new(self);
        // Drop the arena handle but skip the pool return in Drop.
        unsafe {
            drop(ptr::read(&this.arena));
        }
        this.idx
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        self.arena.insert(self.idx);
    }
}

impl std::fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuf")
            .field("idx", &self.idx)
            .field("buf_size", &self.arena.buf_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_never_hands_out_sentinel() {
        let arena = BufferArena::new(4, 256);
        let mut seen = Vec::new();
        while let Some(idx) = arena.extract() {
            assert_ne!(idx, NO_BUF);
            seen.push(idx);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn lease_returns_on_drop() {
        let arena = BufferArena::new(8, 256);
        assert_eq!(arena.available(), 7);
        {
            let _a = arena.lease().unwrap();
            let _b = arena.lease().unwrap();
            assert_eq!(arena.available(), 5);
        }
        assert_eq!(arena.available(), 7);
    }

    #[test]
    fn detach_skips_pool_return() {
        let arena = BufferArena::new(4, 64);
        let lease = arena.lease().unwrap();
        let idx = lease.index();
        assert_eq!(lease.detach(), idx);
        assert_eq!(arena.available(), 2);
        // A descriptor slot would now own idx; give it back explicitly.
        arena.insert(idx);
        assert_eq!(arena.available(), 3);
    }

    #[test]
    fn lease_reads_and_writes() {
        let arena = BufferArena::new(4, 64);
        let mut lease = arena.lease().unwrap();
        lease.bytes_mut(4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(lease.bytes(4), &[1, 2, 3, 4]);
        // Clamped past the buffer size.
        assert_eq!(lease.bytes(1000).len(), 64);
    }

    #[test]
    fn lease_debug_names_the_index() {
        let arena = BufferArena::new(4, 64);
        let lease = arena.lease().unwrap();
        let text = format!("{lease:?}");
        assert!(text.contains("PoolBuf"));
        assert!(text.contains(&lease.index().to_string()));
    }

    #[test]
    fn exhaustion_returns_none() {
        let arena = BufferArena::new(2, 64);
        let a = arena.lease().unwrap();
        assert!(arena.lease().is_none());
        drop(a);
        assert!(arena.lease().is_some());
    }
}
