//! Zero-Copy RX Adapter
//!
//! Drains a span of a device's RX rings in bursts. Each received frame
//! leaves the descriptor ring without a copy when the buffer pool can
//! supply a replacement buffer for the vacated slot; otherwise the
//! frame is privately copied and the resident buffer stays in place.
//!
//! # Design
//!
//! - Burst clamp: at most `burst` frames per ring per invocation, with
//!   the excess counted and turned into a reschedule so the task keeps
//!   draining without monopolizing the worker.
//! - Cursor discipline: `cur` advances per frame, `head` is published
//!   once per batch.
//! - Pool exhaustion on the copy fallback is fatal: the dataplane
//!   cannot make progress without buffers, and the error is surfaced
//!   to the host for teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use zcio_core::{Packet, PoolBuf};

use crate::device::{Device, SLOT_BUF_CHANGED};
use crate::sched::TaskHook;
use crate::DEFAULT_BURST;

/// RX adapter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxConfig {
    /// First RX ring to service.
    pub queue: usize,
    /// Number of rings to service; 0 takes every ring from `queue` up.
    pub nr_queues: usize,
    /// Put the device in promiscuous mode.
    pub promisc: bool,
    /// Maximum frames per ring per invocation.
    pub burst: u32,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            queue: 0,
            nr_queues: 0,
            promisc: false,
            burst: DEFAULT_BURST as u32,
        }
    }
}

/// RX adapter failures.
#[derive(Debug, Error)]
pub enum RxError {
    /// The configured ring span does not exist on the device.
    #[error("rx queue span {queue}..{end} exceeds device rings {rings}")]
    QueueOutOfRange {
        /// First configured ring.
        queue: usize,
        /// One past the last configured ring.
        end: usize,
        /// RX rings the device has.
        rings: usize,
    },
    /// The buffer pool ran dry while a frame needed a private copy.
    /// Unrecoverable: the host should tear the dataplane down.
    #[error("buffer pool exhausted, cannot receive")]
    OutOfBuffers,
}

/// Receives frames from a span of RX rings as [`Packet`]s.
pub struct RxAdapter {
    device: Arc<Device>,
    queue_begin: usize,
    queue_end: usize,
    burst: u32,
    count: AtomicU64,
    task: Arc<dyn TaskHook>,
}

impl RxAdapter {
    /// Bind an adapter to `device` per `cfg`.
    pub fn new(
        device: Arc<Device>,
        cfg: RxConfig,
        task: Arc<dyn TaskHook>,
    ) -> Result<Self, RxError> {
        let rings = device.rx_rings();
        let queue_end = if cfg.nr_queues == 0 {
            rings
        } else {
            cfg.queue + cfg.nr_queues
        };
        if cfg.queue >= queue_end || queue_end > rings {
            return Err(RxError::QueueOutOfRange {
                queue: cfg.queue,
                end: queue_end,
                rings,
            });
        }
        if cfg.promisc {
            device.set_promisc(true);
        }
        tracing::debug!(
            device = device.name(),
            queues = ?(cfg.queue..queue_end),
            burst = cfg.burst,
            "rx adapter bound"
        );
        Ok(Self {
            device,
            queue_begin: cfg.queue,
            queue_end,
            burst: cfg.burst,
            count: AtomicU64::new(0),
            task,
        })
    }

    /// Scheduled-task entry point.
    pub fn run_task(&self, sink: &mut dyn FnMut(Packet)) -> Result<bool, RxError> {
        self.receive_packets(true, sink)
    }

    /// Readiness-notification entry point.
    pub fn on_readable(&self, sink: &mut dyn FnMut(Packet)) -> Result<bool, RxError> {
        self.receive_packets(false, sink)
    }

    /// Drain up to `burst` frames from each serviced ring into `sink`.
    /// Returns whether any frame was delivered.
    ///
    /// `from_task` selects the reschedule flavor used when more frames
    /// are pending than the burst allowed.
    pub fn receive_packets(
        &self,
        from_task: bool,
        sink: &mut dyn FnMut(Packet),
    ) -> Result<bool, RxError> {
        let arena = self.device.arena();
        let mut got = 0u64;
        let mut nr_pending = 0u32;

        for q in self.queue_begin..self.queue_end {
            let mut ring = self.device.rx_ring(q).lock();
            let avail = ring.space();
            let n = avail.min(self.burst);
            nr_pending += avail - n;

            let mut cur = ring.cur;
            for _ in 0..n {
                let (buf_idx, len) = {
                    let slot = ring.slot(cur);
                    (slot.buf_idx, slot.len as usize)
                };
                match arena.extract() {
                    Some(replacement) => {
                        // Zero-copy: adopt the received buffer and
                        // leave a fresh one in the slot.
                        let lease = PoolBuf::adopt(arena.clone(), buf_idx);
                        sink(Packet::from_pool(lease, len));
                        let slot = ring.slot_mut(cur);
                        slot.buf_idx = replacement;
                        slot.flags |= SLOT_BUF_CHANGED;
                    }
                    None => {
                        // Pool dry: copy out and keep the resident
                        // buffer in place.
                        let data = unsafe { &arena.buf(buf_idx)[..len] };
                        let packet = Packet::copied(data).map_err(|e| {
                            tracing::error!(
                                device = self.device.name(),
                                queue = q,
                                error = %e,
                                "no more buffers, receive path is dead"
                            );
                            RxError::OutOfBuffers
                        })?;
                        sink(packet);
                    }
                }
                cur = ring.next(cur);
                got += 1;
            }
            // Publish the whole batch at once.
            ring.cur = cur;
            ring.head = cur;
        }

        if nr_pending > self.burst {
            if from_task {
                self.task.fast_reschedule();
            } else {
                self.task.reschedule();
            }
        }

        self.count.fetch_add(got, Ordering::Relaxed);
        Ok(got > 0)
    }

    /// Total frames delivered since construction or the last reset.
    pub fn received(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Zero the received counter.
    pub fn reset_counts(&self) {
        self.count.store(0, Ordering::Relaxed);
    }

    /// The device this adapter reads from.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl std::fmt::Debug for RxAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxAdapter")
            .field("device", &self.device.name())
            .field("queues", &(self.queue_begin..self.queue_end))
            .field("burst", &self.burst)
            .finish()
    }
}
