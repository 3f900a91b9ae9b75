//! Zero-Copy TX Adapter
//!
//! Moves packets onto a span of a device's TX descriptor rings. A
//! packet whose payload is a buffer of the device's own arena is
//! handed over by swapping buffer indices with the slot; anything else
//! is copied into the slot's resident buffer.
//!
//! Two driving modes share the ring-writing core:
//!
//! - **Push**: any number of threads hold a [`TxPusher`], batching
//!   packets in a private list and flushing at `burst` under the
//!   adapter's coarse lock.
//! - **Pull**: a single [`TxPullTask`] owns the rings, pulling batches
//!   from an upstream [`PacketSource`] and parking on writability with
//!   a doubling backoff when the rings are full.
//!
//! Ring synchronization is a syscall-shaped cost, so it is throttled:
//! a per-queue done flag suppresses repeat syncs until a deferred
//! timer clears it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use zcio_core::{Packet, PacketList};

use crate::device::{Device, SLOT_BUF_CHANGED};
use crate::sched::{spin_retry, SyncTimer, TaskHook};
use crate::{DEFAULT_BURST, DEFAULT_INTERNAL_QUEUE};

/// Flush retries before a stuck push path forces a ring sync.
const MAX_PUSH_BACKOFF: u32 = 128;

/// Push-mode deferred sync delay.
const PUSH_SYNC_DELAY_US: u64 = 1;

/// Pull-mode retry backoff bounds, doubling between them.
const MIN_PULL_BACKOFF_US: u64 = 1;
const MAX_PULL_BACKOFF_US: u64 = 256;

/// TX adapter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxConfig {
    /// Service only this TX ring; `None` services all of them.
    pub queue: Option<usize>,
    /// Per-pusher internal queue capacity.
    pub iqueue: usize,
    /// Spin on internal-queue overflow instead of dropping.
    pub blocking: bool,
    /// Maximum packets written per ring per flush.
    pub burst: u32,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            queue: None,
            iqueue: DEFAULT_INTERNAL_QUEUE,
            blocking: true,
            burst: DEFAULT_BURST as u32,
        }
    }
}

/// TX adapter failures.
#[derive(Debug, Error)]
pub enum TxError {
    /// The internal queue must absorb at least two bursts, or pushers
    /// would flush on nearly every packet.
    #[error("internal queue of {iqueue} cannot hold two bursts of {burst}")]
    IqueueTooSmall {
        /// Configured internal queue capacity.
        iqueue: usize,
        /// Configured burst.
        burst: u32,
    },
    /// The configured ring does not exist on the device.
    #[error("tx queue {queue} exceeds device rings {rings}")]
    QueueOutOfRange {
        /// Configured ring.
        queue: usize,
        /// TX rings the device has.
        rings: usize,
    },
    /// The device has no TX ring for the adapter to service.
    #[error("device has no tx rings")]
    NoTxRings,
}

/// State serialized under the adapter's coarse lock.
struct TxShared {
    /// Next queue a batch starts on, for round-robin spreading.
    last_queue: usize,
}

/// Writes packets to a span of TX rings. Shared by every pusher and
/// pull task driving the same device span.
pub struct TxAdapter {
    device: Arc<Device>,
    queue_begin: usize,
    queue_end: usize,
    burst: u32,
    iqueue: usize,
    blocking: bool,
    shared: Mutex<TxShared>,
    /// Per-queue flag: a sync already ran in the current timer window.
    iodone: Box<[AtomicBool]>,
    /// Consecutive flushes that left packets behind.
    backoff: AtomicU32,
    sync_timer: Arc<dyn SyncTimer>,
    count: AtomicU64,
    dropped: AtomicU64,
}

impl TxAdapter {
    /// Bind an adapter to `device` per `cfg`.
    pub fn new(
        device: Arc<Device>,
        cfg: TxConfig,
        sync_timer: Arc<dyn SyncTimer>,
    ) -> Result<Arc<Self>, TxError> {
        if cfg.iqueue < 2 * cfg.burst as usize {
            return Err(TxError::IqueueTooSmall {
                iqueue: cfg.iqueue,
                burst: cfg.burst,
            });
        }
        let rings = device.tx_rings();
        if rings == 0 {
            return Err(TxError::NoTxRings);
        }
        let (queue_begin, queue_end) = match cfg.queue {
            Some(q) if q >= rings => {
                return Err(TxError::QueueOutOfRange { queue: q, rings });
            }
            Some(q) => (q, q + 1),
            None => (0, rings),
        };
        let ring_slots = device.tx_ring(queue_begin).lock().num_slots();
        if cfg.burst > ring_slots / 2 {
            tracing::warn!(
                device = device.name(),
                burst = cfg.burst,
                ring_slots,
                "burst exceeds half the ring, expect frequent full-ring stalls"
            );
        }
        let nqueues = queue_end - queue_begin;
        Ok(Arc::new(Self {
            device,
            queue_begin,
            queue_end,
            burst: cfg.burst,
            iqueue: cfg.iqueue,
            blocking: cfg.blocking,
            shared: Mutex::new(TxShared { last_queue: 0 }),
            iodone: (0..nqueues).map(|_| AtomicBool::new(false)).collect(),
            backoff: AtomicU32::new(0),
            sync_timer,
            count: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }))
    }

    /// A per-thread push handle.
    pub fn pusher(self: &Arc<Self>) -> TxPusher {
        TxPusher {
            adapter: self.clone(),
            queue: PacketList::new(),
        }
    }

    /// The pull-mode driver for this adapter's ring span.
    pub fn pull_task(self: &Arc<Self>, task: Arc<dyn TaskHook>) -> TxPullTask {
        TxPullTask {
            adapter: self.clone(),
            queue: PacketList::new(),
            backoff_us: MIN_PULL_BACKOFF_US,
            task,
        }
    }

    /// Re-arm ring synchronization on every queue. Called when the
    /// deferred sync timer fires.
    pub fn on_sync_timer(&self) {
        self.allow_txsync();
    }

    /// Total packets written to descriptor rings.
    pub fn n_sent(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Total packets dropped, either on internal-queue overflow or
    /// because they cannot fit a descriptor buffer.
    pub fn n_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Zero both counters.
    pub fn reset_counts(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }

    /// The device this adapter writes to.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn allow_txsync(&self) {
        for flag in self.iodone.iter() {
            flag.store(false, Ordering::Release);
        }
    }

    /// Sync queue `q` unless one already ran in this timer window.
    fn try_txsync(&self, q: usize) {
        if !self.iodone[q - self.queue_begin].swap(true, Ordering::AcqRel) {
            self.device.txsync(q);
        }
    }

    /// Write packets from `list` onto the ring span, round-robin from
    /// the queue after the previous batch's. The routine stops only
    /// when the list is exhausted or every queue is out of space;
    /// unsent packets stay at the front of `list`. Returns how many
    /// were written.
    fn send_packets(&self, sh: &mut TxShared, list: &mut PacketList, push: bool) -> usize {
        let arena = self.device.arena();
        let nqueues = self.queue_end - self.queue_begin;
        let start = sh.last_queue;
        let mut sent_total = 0usize;

        for iloop in 0..nqueues {
            let qn = (start + iloop) % nqueues;
            let q = self.queue_begin + qn;
            let mut used = false;
            {
                let mut ring = self.device.tx_ring(q).lock();
                if ring.is_empty() && push {
                    // No free slot: a sync may reclaim transmitted
                    // ones. Retry the queue if it did.
                    drop(ring);
                    self.try_txsync(q);
                    ring = self.device.tx_ring(q).lock();
                }
                if ring.is_empty() {
                    continue;
                }
                let mut cur = ring.cur;
                while cur != ring.tail {
                    let Some(packet) = list.pop_front() else { break };
                    let len = packet.len();
                    if len > arena.buf_size() || len > usize::from(u16::MAX) {
                        // Cannot fit any descriptor buffer; dropping
                        // beats corrupting the ring.
                        drop(packet);
                        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped <= 10 || dropped % 100 == 1 {
                            tracing::warn!(
                                device = self.device.name(),
                                len,
                                max = arena.buf_size(),
                                "oversized packet dropped on tx"
                            );
                        }
                        continue;
                    }
                    if packet.pool_owned_by(arena) {
                        if let Ok(lease) = packet.into_pool_buf() {
                            let slot = ring.slot_mut(cur);
                            let old = slot.buf_idx;
                            slot.buf_idx = lease.detach();
                            slot.len = len as u16;
                            slot.flags |= SLOT_BUF_CHANGED;
                            arena.insert(old);
                        }
                    } else {
                        let slot = ring.slot_mut(cur);
                        slot.len = len as u16;
                        let buf_idx = slot.buf_idx;
                        // Sound: the slot is in [cur, tail), so the
                        // resident buffer is software-owned here.
                        let dst = unsafe { arena.buf_mut(buf_idx) };
                        dst[..len].copy_from_slice(packet.data());
                    }
                    cur = ring.next(cur);
                    sent_total += 1;
                    used = true;
                }
                // Publish the batch; head stays at the first unsent
                // slot.
                ring.cur = cur;
                ring.head = cur;
            }
            if used {
                // The next batch starts on the queue after this one.
                sh.last_queue = (qn + 1) % nqueues;
                if push {
                    self.try_txsync(q);
                }
            }
            if list.is_empty() {
                break;
            }
        }

        self.count.fetch_add(sent_total as u64, Ordering::Relaxed);
        sent_total
    }
}

/// Per-thread push handle: a private batch list flushed onto the
/// shared rings at `burst`.
pub struct TxPusher {
    adapter: Arc<TxAdapter>,
    queue: PacketList,
}

impl TxPusher {
    /// Queue `packet` for transmission, flushing when a burst has
    /// accumulated.
    ///
    /// On internal-queue overflow the blocking policy keeps the packet
    /// and spins in the flush until the rings drain; the non-blocking
    /// policy drops it with a rate-limited diagnostic.
    pub fn push(&mut self, packet: Packet) {
        if self.queue.len() < self.adapter.iqueue || self.adapter.blocking {
            self.queue.append(packet);
        } else {
            drop(packet);
            let dropped = self.adapter.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped <= 10 || dropped % 100 == 1 {
                tracing::warn!(
                    device = self.adapter.device.name(),
                    dropped,
                    queued = self.queue.len(),
                    "tx internal queue full, dropping packet"
                );
            }
        }
        if self.queue.len() >= self.adapter.burst as usize {
            self.flush();
        }
    }

    /// Flush the batch list onto the rings.
    ///
    /// Under the blocking policy an over-capacity batch holds the
    /// caller here until the rings absorb it, propagating backpressure
    /// upstream.
    pub fn flush(&mut self) {
        if !self.adapter.blocking {
            self.flush_once();
            return;
        }
        let adapter = self.adapter.clone();
        spin_retry(
            || {
                self.flush_once();
                self.queue.len() < adapter.iqueue
            },
            || adapter.allow_txsync(),
        );
    }

    fn flush_once(&mut self) {
        let adapter = &*self.adapter;
        let sent = {
            let mut sh = adapter.shared.lock();
            adapter.send_packets(&mut sh, &mut self.queue, true)
        };

        if !self.queue.is_empty() {
            let backoff = adapter.backoff.fetch_add(1, Ordering::Relaxed);
            if backoff < MAX_PUSH_BACKOFF {
                if !adapter.sync_timer.scheduled() {
                    adapter
                        .sync_timer
                        .schedule_after(Duration::from_micros(PUSH_SYNC_DELAY_US));
                }
            } else {
                // Stuck too long: force the next flush to sync.
                adapter.backoff.store(0, Ordering::Relaxed);
                adapter.allow_txsync();
            }
        } else if sent > 0 {
            adapter.backoff.store(0, Ordering::Relaxed);
        }
    }

    /// Packets waiting in the batch list.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for TxPusher {
    fn drop(&mut self) {
        // Drain what we can; a wedged device must not hang teardown.
        while !self.queue.is_empty() {
            self.adapter.allow_txsync();
            let before = self.queue.len();
            self.flush_once();
            if self.queue.len() == before {
                tracing::warn!(
                    device = self.adapter.device.name(),
                    stranded = before,
                    "tx pusher dropped with unsendable packets"
                );
                break;
            }
        }
    }
}

/// Upstream a pull-mode TX task draws packets from.
pub trait PacketSource {
    /// The next packet, or `None` when the upstream is momentarily
    /// empty.
    fn pull(&mut self) -> Option<Packet>;
}

/// Pull-mode driver: owns the adapter's ring span, batching from a
/// [`PacketSource`].
pub struct TxPullTask {
    adapter: Arc<TxAdapter>,
    /// Unsent remainder carried between runs; drained before the
    /// source is pulled again.
    queue: PacketList,
    backoff_us: u64,
    task: Arc<dyn TaskHook>,
}

impl TxPullTask {
    /// One task invocation: top the batch up to `burst` from `source`
    /// and write it out. Returns whether any packet moved.
    ///
    /// A full ring span parks the task on writability with a deferred
    /// retry, doubling the delay up to a cap; an idle source backs off
    /// the same way. Progress resets the delay.
    pub fn run_task(&mut self, source: &mut dyn PacketSource) -> bool {
        let adapter = &*self.adapter;
        while self.queue.len() < adapter.burst as usize {
            let Some(packet) = source.pull() else { break };
            self.queue.append(packet);
        }

        let mut total = 0usize;
        if !self.queue.is_empty() {
            let mut sh = adapter.shared.lock();
            loop {
                let sent = adapter.send_packets(&mut sh, &mut self.queue, false);
                total += sent;
                if sent == 0 || self.queue.is_empty() {
                    break;
                }
            }
        }

        if total > 0 {
            self.backoff_us = MIN_PULL_BACKOFF_US;
        }

        if !self.queue.is_empty() {
            // Rings full. Reclaim what hardware has finished, then
            // wait for writable space with a timer backstop.
            adapter.allow_txsync();
            for q in adapter.queue_begin..adapter.queue_end {
                adapter.try_txsync(q);
                self.task.watch_writable(q);
            }
            self.task
                .schedule_after(Duration::from_micros(self.backoff_us));
            self.backoff_us = (self.backoff_us * 2).min(MAX_PULL_BACKOFF_US);
            total > 0
        } else if total == 0 {
            // Idle source: poll again later.
            self.task
                .schedule_after(Duration::from_micros(self.backoff_us));
            self.backoff_us = (self.backoff_us * 2).min(MAX_PULL_BACKOFF_US);
            false
        } else {
            self.task.fast_reschedule();
            true
        }
    }

    /// Writable-space notification for queue `q`.
    pub fn on_writable(&mut self, q: usize) {
        self.task.unwatch_writable(q);
        self.task.reschedule();
    }

    /// Packets carried over from previous runs.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
