//! Memory-Mapped Device Model
//!
//! Minimal netmap-style abstraction over a NIC: a fixed count of RX
//! and TX descriptor rings, each a circular array of
//! `{buffer index, length, flags}` slots with advancing cursors, all
//! backed by one buffer arena shared with the software side.
//!
//! Cursor protocol (both directions): software owns the slots in
//! `[cur, tail)`. On RX those hold received frames; on TX those are
//! free for outgoing frames. Software advances `cur` as it works and
//! publishes progress by setting `head = cur`, once per batch. An
//! explicit sync call makes published TX descriptors visible to
//! hardware and reclaims transmitted slots.
//!
//! The backend here is memory-backed: `fill_rx` plays the role of the
//! wire on ingress, and synced TX frames land in an egress capture.
//! That is all the dataplane needs; real driver plumbing stays out of
//! scope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use zcio_core::pool::BufferArena;

/// Slot flag: the buffer index changed and hardware must reload it.
pub const SLOT_BUF_CHANGED: u16 = 0x0001;

/// Extra pool buffers reserved beyond the ring-resident ones when the
/// arena is auto-sized, so RX can keep leasing replacements under
/// load.
const ARENA_POOL_RESERVE: usize = 2048;

/// One hardware descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slot {
    /// Arena buffer index backing this slot.
    pub buf_idx: u32,
    /// Frame length in bytes.
    pub len: u16,
    /// Slot flags ([`SLOT_BUF_CHANGED`]).
    pub flags: u16,
}

/// A descriptor ring with netmap-style cursors.
pub struct DescRing {
    slots: Box<[Slot]>,
    /// Next slot software will work on.
    pub cur: u32,
    /// First slot not yet published to hardware; set to `cur` once per
    /// batch.
    pub head: u32,
    /// First slot owned by hardware; software may use `[cur, tail)`.
    pub tail: u32,
    /// Software backend only: first published slot hardware has not
    /// consumed yet.
    hw_cur: u32,
}

enum RingKind {
    Rx,
    Tx,
}

impl DescRing {
    fn new(bufs: Vec<u32>, kind: RingKind) -> Self {
        let num_slots = bufs.len() as u32;
        let slots = bufs
            .into_iter()
            .map(|buf_idx| Slot {
                buf_idx,
                len: 0,
                flags: 0,
            })
            .collect();
        let tail = match kind {
            // RX starts empty: hardware has filled nothing yet.
            RingKind::Rx => 0,
            // TX starts with every slot free except the one-slot gap.
            RingKind::Tx => num_slots - 1,
        };
        Self {
            slots,
            cur: 0,
            head: 0,
            tail,
            hw_cur: 0,
        }
    }

    /// Number of descriptor slots.
    #[inline]
    pub fn num_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    /// The slot index after `idx`, wrapping.
    #[inline]
    pub fn next(&self, idx: u32) -> u32 {
        if idx + 1 == self.num_slots() {
            0
        } else {
            idx + 1
        }
    }

    /// Slots available to software: `[cur, tail)`.
    #[inline]
    pub fn space(&self) -> u32 {
        let n = self.num_slots();
        (self.tail + n - self.cur) % n
    }

    /// True when software has no slot to work on.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cur == self.tail
    }

    /// Shared view of slot `idx`.
    #[inline]
    pub fn slot(&self, idx: u32) -> &Slot {
        &self.slots[idx as usize]
    }

    /// Mutable view of slot `idx`.
    #[inline]
    pub fn slot_mut(&mut self, idx: u32) -> &mut Slot {
        &mut self.slots[idx as usize]
    }
}

/// Device construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, for diagnostics.
    pub name: String,
    /// Number of hardware RX rings.
    pub rx_rings: usize,
    /// Number of hardware TX rings.
    pub tx_rings: usize,
    /// Descriptor slots per ring.
    pub ring_slots: u32,
    /// Total arena buffers; 0 auto-sizes to the ring-resident count
    /// plus a pool reserve.
    pub arena_bufs: usize,
    /// Bytes per arena buffer.
    pub buf_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "zcio0".to_string(),
            rx_rings: 1,
            tx_rings: 1,
            ring_slots: 256,
            arena_bufs: 0,
            buf_size: 2048,
        }
    }
}

/// Device construction errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A device must expose at least one ring.
    #[error("device needs at least one hardware ring")]
    NoRings,
    /// Descriptor rings need the one-slot gap plus one usable slot.
    #[error("ring_slots must be at least 2, got {0}")]
    BadRingSlots(u32),
    /// The arena cannot back every descriptor slot.
    #[error("arena of {have} buffers cannot back {need} descriptor slots")]
    ArenaTooSmall {
        /// Configured buffer count.
        have: usize,
        /// Buffers required by the rings plus the reserved index.
        need: usize,
    },
}

/// An opened device: descriptor rings plus the buffer arena they
/// exchange slots with.
pub struct Device {
    name: String,
    arena: Arc<BufferArena>,
    rx: Vec<Mutex<DescRing>>,
    tx: Vec<Mutex<DescRing>>,
    promisc: AtomicBool,
    egress: Mutex<Vec<Vec<u8>>>,
}

impl Device {
    /// Open a memory-backed device.
    pub fn new(cfg: DeviceConfig) -> Result<Arc<Self>, DeviceError> {
        if cfg.rx_rings + cfg.tx_rings == 0 {
            return Err(DeviceError::NoRings);
        }
        if cfg.ring_slots < 2 {
            return Err(DeviceError::BadRingSlots(cfg.ring_slots));
        }

        let resident = (cfg.rx_rings + cfg.tx_rings) * cfg.ring_slots as usize;
        let need = resident + 1; // +1 for the reserved index 0
        let total = if cfg.arena_bufs == 0 {
            need + ARENA_POOL_RESERVE
        } else {
            cfg.arena_bufs
        };
        if total < need {
            return Err(DeviceError::ArenaTooSmall { have: total, need });
        }

        let arena = BufferArena::new(total, cfg.buf_size);
        let lease_ring = |kind: RingKind| {
            let bufs: Vec<u32> = (0..cfg.ring_slots)
                .map(|_| arena.extract().expect("arena sized for all ring slots"))
                .collect();
            Mutex::new(DescRing::new(bufs, kind))
        };
        let rx = (0..cfg.rx_rings).map(|_| lease_ring(RingKind::Rx)).collect();
        let tx = (0..cfg.tx_rings).map(|_| lease_ring(RingKind::Tx)).collect();

        tracing::info!(
            name = %cfg.name,
            rx_rings = cfg.rx_rings,
            tx_rings = cfg.tx_rings,
            ring_slots = cfg.ring_slots,
            pool = arena.available(),
            "device opened"
        );

        Ok(Arc::new(Self {
            name: cfg.name,
            arena,
            rx,
            tx,
            promisc: AtomicBool::new(false),
            egress: Mutex::new(Vec::new()),
        }))
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The arena backing this device's rings.
    pub fn arena(&self) -> &Arc<BufferArena> {
        &self.arena
    }

    /// Number of RX rings.
    pub fn rx_rings(&self) -> usize {
        self.rx.len()
    }

    /// Number of TX rings.
    pub fn tx_rings(&self) -> usize {
        self.tx.len()
    }

    /// RX descriptor ring `q`.
    pub fn rx_ring(&self, q: usize) -> &Mutex<DescRing> {
        &self.rx[q]
    }

    /// TX descriptor ring `q`.
    pub fn tx_ring(&self, q: usize) -> &Mutex<DescRing> {
        &self.tx[q]
    }

    /// Put the device in or out of promiscuous mode.
    pub fn set_promisc(&self, on: bool) {
        if self.promisc.swap(on, Ordering::Relaxed) != on {
            tracing::debug!(name = %self.name, promisc = on, "promiscuous mode changed");
        }
    }

    /// Whether the device is in promiscuous mode.
    pub fn promisc(&self) -> bool {
        self.promisc.load(Ordering::Relaxed)
    }

    /// Full TX ring synchronization for queue `q`: hardware consumes
    /// every published descriptor and the slots become free again.
    /// Comparatively expensive; callers throttle it.
    pub fn txsync(&self, q: usize) {
        let mut ring = self.tx[q].lock();
        let n = ring.num_slots();
        let mut egress = self.egress.lock();
        let mut i = ring.hw_cur;
        while i != ring.head {
            let slot = ring.slot(i);
            let frame = unsafe { &self.arena.buf(slot.buf_idx)[..slot.len as usize] };
            egress.push(frame.to_vec());
            i = ring.next(i);
        }
        ring.hw_cur = ring.head;
        ring.tail = (ring.head + n - 1) % n;
    }

    /// Software ingress: write frames into RX ring `q` as hardware
    /// would, returning how many fit.
    pub fn fill_rx(&self, q: usize, frames: &[&[u8]]) -> usize {
        let mut ring = self.rx[q].lock();
        let mut filled = 0;
        for frame in frames {
            if ring.next(ring.tail) == ring.head {
                break; // ring full, one-slot gap preserved
            }
            debug_assert!(frame.len() <= self.arena.buf_size());
            let tail = ring.tail;
            let buf_idx = ring.slot(tail).buf_idx;
            let dst = unsafe { self.arena.buf_mut(buf_idx) };
            dst[..frame.len()].copy_from_slice(frame);
            let slot = ring.slot_mut(tail);
            slot.len = frame.len() as u16;
            slot.flags = 0;
            ring.tail = ring.next(tail);
            filled += 1;
        }
        filled
    }

    /// Take the frames transmitted since the last call (software
    /// backend egress capture).
    pub fn take_egress(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.egress.lock())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Ring-resident buffers go back to the pool so the arena is
        // whole at teardown.
        for ring in self.rx.iter().chain(self.tx.iter()) {
            let ring = ring.lock();
            for i in 0..ring.num_slots() {
                self.arena.insert(ring.slot(i).buf_idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_device() -> Arc<Device> {
        Device::new(DeviceConfig {
            name: "test0".into(),
            rx_rings: 1,
            tx_rings: 1,
            ring_slots: 4,
            arena_bufs: 16,
            buf_size: 256,
        })
        .unwrap()
    }

    #[test]
    fn config_validation() {
        assert!(matches!(
            Device::new(DeviceConfig {
                rx_rings: 0,
                tx_rings: 0,
                ..Default::default()
            }),
            Err(DeviceError::NoRings)
        ));
        assert!(matches!(
            Device::new(DeviceConfig {
                ring_slots: 1,
                ..Default::default()
            }),
            Err(DeviceError::BadRingSlots(1))
        ));
        assert!(matches!(
            Device::new(DeviceConfig {
                ring_slots: 8,
                arena_bufs: 4,
                ..Default::default()
            }),
            Err(DeviceError::ArenaTooSmall { .. })
        ));
    }

    #[test]
    fn rx_fill_respects_ring_capacity() {
        let dev = small_device();
        let frames: Vec<&[u8]> = vec![b"aa", b"bb", b"cc", b"dd", b"ee"];
        // 4 slots, one-slot gap: 3 frames fit.
        assert_eq!(dev.fill_rx(0, &frames), 3);
        let ring = dev.rx_ring(0).lock();
        assert_eq!(ring.space(), 3);
        assert_eq!(ring.slot(0).len, 2);
    }

    #[test]
    fn tx_ring_starts_with_free_slots() {
        let dev = small_device();
        let ring = dev.tx_ring(0).lock();
        assert_eq!(ring.space(), 3);
        assert!(!ring.is_empty());
    }

    #[test]
    fn txsync_reclaims_published_slots() {
        let dev = small_device();
        {
            let mut ring = dev.tx_ring(0).lock();
            // Publish two frames by hand.
            for byte in [0x11u8, 0x22] {
                let cur = ring.cur;
                let buf_idx = ring.slot(cur).buf_idx;
                unsafe { dev.arena().buf_mut(buf_idx)[0] = byte };
                ring.slot_mut(cur).len = 1;
                ring.cur = ring.next(cur);
            }
            ring.head = ring.cur;
            assert_eq!(ring.space(), 1);
        }
        dev.txsync(0);
        let frames = dev.take_egress();
        assert_eq!(frames, vec![vec![0x11], vec![0x22]]);
        assert_eq!(dev.tx_ring(0).lock().space(), 3);
    }

    #[test]
    fn drop_returns_ring_buffers_to_pool() {
        let dev = small_device();
        let arena = dev.arena().clone();
        let free_before = arena.available();
        drop(dev);
        // 2 rings * 4 slots returned.
        assert_eq!(arena.available(), free_before + 8);
    }
}
