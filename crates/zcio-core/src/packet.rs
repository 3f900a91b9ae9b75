//! Packet View and Intrusive Batch List
//!
//! A [`Packet`] is a length-delimited view of either a pool-owned
//! arena buffer (zero-copy) or a privately copied payload. Releasing
//! the underlying buffer happens exactly once, when the packet is
//! dropped or its pool buffer is detached for hardware hand-off.
//!
//! [`PacketList`] chains packets intrusively through their `next`
//! links with an explicit tail pointer, giving O(1) append and O(1)
//! front removal. This replaces the `head.prev == tail` pointer trick
//! sometimes used for singly-linked batches: the tail is tracked in
//! the list handle itself, and the invariant is that `tail` points at
//! the last node of the `head` chain whenever the list is non-empty.

use std::mem;
use std::ptr;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::pool::{BufferArena, PoolBuf};

/// Private-copy allocation failed; the only unrecoverable resource
/// failure in the dataplane.
#[derive(Debug, Error)]
#[error("failed to allocate {len} bytes for a private packet copy")]
pub struct PacketAllocError {
    /// Requested payload length.
    pub len: usize,
}

enum Payload {
    /// Zero-copy view of a leased arena buffer.
    Pool(PoolBuf),
    /// Privately copied payload.
    Copied(Bytes),
}

/// A packet: payload view plus an intrusive link used by
/// [`PacketList`].
pub struct Packet {
    payload: Payload,
    len: usize,
    next: Option<Box<Packet>>,
}

impl Packet {
    /// Wrap a leased pool buffer holding `len` payload bytes.
    pub fn from_pool(buf: PoolBuf, len: usize) -> Self {
        debug_assert!(len <= buf.arena().buf_size());
        Self {
            payload: Payload::Pool(buf),
            len,
            next: None,
        }
    }

    /// Copy `data` into a private allocation. Fails only when the
    /// allocation itself fails.
    pub fn copied(data: &[u8]) -> Result<Self, PacketAllocError> {
        let mut v = Vec::new();
        v.try_reserve_exact(data.len())
            .map_err(|_| PacketAllocError { len: data.len() })?;
        v.extend_from_slice(data);
        Ok(Self {
            payload: Payload::Copied(Bytes::from(v)),
            len: data.len(),
            next: None,
        })
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-length packets.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Payload::Pool(buf) => buf.bytes(self.len),
            Payload::Copied(bytes) => &bytes[..self.len],
        }
    }

    /// Whether the payload lives in a pool-owned arena buffer.
    #[inline]
    pub fn is_pool_owned(&self) -> bool {
        matches!(self.payload, Payload::Pool(_))
    }

    /// Whether the payload is a buffer of `arena` specifically, and
    /// can therefore be adopted by that device's descriptor rings.
    #[inline]
    pub fn pool_owned_by(&self, arena: &Arc<BufferArena>) -> bool {
        match &self.payload {
            Payload::Pool(buf) => Arc::ptr_eq(buf.arena(), arena),
            Payload::Copied(_) => false,
        }
    }

    /// Take the pool buffer out of the packet for hardware hand-off.
    /// Returns the packet unchanged when its payload is a private
    /// copy.
    pub fn into_pool_buf(self) -> Result<PoolBuf, Packet> {
        debug_assert!(self.next.is_none(), "detach packets from their list first");
        match self.payload {
            Payload::Pool(buf) => Ok(buf),
            payload @ Payload::Copied(_) => Err(Packet {
                payload,
                len: self.len,
                next: None,
            }),
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("pool_owned", &self.is_pool_owned())
            .finish()
    }
}

/// Intrusive FIFO list of packets with O(1) append.
///
/// Invariant: `tail` points at the last node reachable from `head`,
/// or is null iff the list is empty. Every `next` chain is
/// null-terminated.
pub struct PacketList {
    head: Option<Box<Packet>>,
    tail: *mut Packet,
    len: usize,
}

// The tail pointer aliases a node owned by the head chain; the list is
// moved between threads as a unit (e.g. under the TX coarse lock), so
// sending is sound.
unsafe impl Send for PacketList {}

impl PacketList {
    /// Empty list.
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    /// Append `packet` at the back in O(1).
    pub fn append(&mut self, mut packet: Packet) {
        packet.next = None;
        let mut node = Box::new(packet);
        let raw: *mut Packet = &mut *node;
        if self.tail.is_null() {
            self.head = Some(node);
        } else {
            unsafe {
                (*self.tail).next = Some(node);
            }
        }
        self.tail = raw;
        self.len += 1;
    }

    /// Remove and return the front packet.
    pub fn pop_front(&mut self) -> Option<Packet> {
        let mut node = self.head.take()?;
        self.head = node.next.take();
        if self.head.is_none() {
            self.tail = ptr::null_mut();
        }
        self.len -= 1;
        Some(*node)
    }

    /// Detach the whole list, leaving this one empty.
    pub fn take(&mut self) -> PacketList {
        mem::take(self)
    }

    /// Number of queued packets.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no packet is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The front packet, if any.
    pub fn front(&self) -> Option<&Packet> {
        self.head.as_deref()
    }

    /// Iterate the queued packets front to back.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head.as_deref(),
        }
    }
}

impl Default for PacketList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PacketList {
    fn drop(&mut self) {
        // Iterative teardown; a recursive Box drop would overflow the
        // stack on long batches.
        while self.pop_front().is_some() {}
    }
}

/// Front-to-back iterator over a [`PacketList`].
pub struct Iter<'a> {
    next: Option<&'a Packet>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Packet;

    fn next(&mut self) -> Option<Self::Item> {
        let packet = self.next?;
        self.next = packet.next.as_deref();
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferArena;

    fn copied(byte: u8) -> Packet {
        Packet::copied(&[byte, byte, byte]).unwrap()
    }

    #[test]
    fn list_preserves_fifo_order() {
        let mut list = PacketList::new();
        for b in 0..5u8 {
            list.append(copied(b));
        }
        assert_eq!(list.len(), 5);
        for b in 0..5u8 {
            let p = list.pop_front().unwrap();
            assert_eq!(p.data(), &[b, b, b]);
        }
        assert!(list.is_empty());
        assert!(list.pop_front().is_none());
    }

    #[test]
    fn append_after_partial_drain_keeps_tail_valid() {
        let mut list = PacketList::new();
        list.append(copied(1));
        list.append(copied(2));
        list.pop_front().unwrap();
        list.append(copied(3));
        let order: Vec<u8> = list.iter().map(|p| p.data()[0]).collect();
        assert_eq!(order, vec![2, 3]);
    }

    #[test]
    fn take_detaches_everything() {
        let mut list = PacketList::new();
        list.append(copied(9));
        list.append(copied(8));
        let detached = list.take();
        assert!(list.is_empty());
        assert_eq!(detached.len(), 2);
        assert_eq!(detached.front().unwrap().data()[0], 9);
    }

    #[test]
    fn pool_packet_releases_buffer_once() {
        let arena = BufferArena::new(4, 64);
        let baseline = arena.available();
        {
            let mut lease = arena.lease().unwrap();
            lease.bytes_mut(2).copy_from_slice(&[0xAA, 0xBB]);
            let p = Packet::from_pool(lease, 2);
            assert!(p.is_pool_owned());
            assert!(p.pool_owned_by(&arena));
            assert_eq!(p.data(), &[0xAA, 0xBB]);
            assert_eq!(arena.available(), baseline - 1);
        }
        assert_eq!(arena.available(), baseline);
    }

    #[test]
    fn into_pool_buf_splits_by_payload_kind() {
        let arena = BufferArena::new(4, 64);
        let p = Packet::from_pool(arena.lease().unwrap(), 0);
        assert!(p.into_pool_buf().is_ok());

        let p = Packet::copied(&[1, 2]).unwrap();
        let p = p.into_pool_buf().unwrap_err();
        assert_eq!(p.data(), &[1, 2]);
        assert!(!p.pool_owned_by(&arena));
    }

    #[test]
    fn dropping_list_releases_pool_buffers() {
        let arena = BufferArena::new(8, 64);
        let baseline = arena.available();
        let mut list = PacketList::new();
        for _ in 0..3 {
            list.append(Packet::from_pool(arena.lease().unwrap(), 4));
        }
        assert_eq!(arena.available(), baseline - 3);
        drop(list);
        assert_eq!(arena.available(), baseline);
    }
}
