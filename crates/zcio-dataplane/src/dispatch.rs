//! Cross-Thread Packet Dispatcher
//!
//! Decouples N producer threads from one consumer task without paying
//! a scheduler wake-up per packet. Each producer gets a private SPSC
//! ring; the consumer drains every ring in round-robin lane order and
//! uses an adaptive sleepiness counter to decide between busy-polling
//! and going idle until a producer wakes it.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

use zcio_core::{DynamicRing, Packet};

use crate::sched::{spin_retry, TaskHook};
use crate::stats::{aggregate, LaneSnapshot, LaneStats};
use crate::DEFAULT_DISPATCH_CAPACITY;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Per-producer ring capacity (accepted packets, not raw slots).
    pub capacity: usize,
    /// Blocking policy: spin on a full ring instead of dropping.
    pub blocking: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_DISPATCH_CAPACITY,
            blocking: false,
        }
    }
}

/// Shared dispatcher state. Producers and the consumer hold it through
/// their handles.
pub struct Dispatcher {
    rings: Box<[DynamicRing<Packet>]>,
    stats: Box<[CachePadded<LaneStats>]>,
    claimed: Box<[AtomicBool]>,
    sleepiness: AtomicI32,
    sleep_threshold: i32,
    blocking: bool,
    task: Arc<dyn TaskHook>,
}

impl Dispatcher {
    /// Build a dispatcher for `lanes` producer threads. Returns the
    /// shared handle plus the unique consumer handle.
    pub fn new(
        lanes: usize,
        cfg: DispatcherConfig,
        task: Arc<dyn TaskHook>,
    ) -> (Arc<Dispatcher>, DispatchConsumer) {
        assert!(lanes > 0, "dispatcher needs at least one producer lane");
        assert!(cfg.capacity > 0, "dispatcher capacity must be nonzero");

        let dispatcher = Arc::new(Dispatcher {
            // One raw slot stays reserved, so size up by one to honor
            // the configured capacity exactly.
            rings: (0..lanes)
                .map(|_| DynamicRing::new(cfg.capacity + 1))
                .collect(),
            stats: (0..lanes).map(|_| CachePadded::new(LaneStats::default())).collect(),
            claimed: (0..lanes).map(|_| AtomicBool::new(false)).collect(),
            sleepiness: AtomicI32::new(0),
            // Empty-poll budget before the consumer goes idle.
            sleep_threshold: (cfg.capacity / 4) as i32,
            blocking: cfg.blocking,
            task,
        });
        let consumer = DispatchConsumer {
            dispatcher: dispatcher.clone(),
        };
        (dispatcher, consumer)
    }

    /// Claim producer lane `lane`. Each lane can be claimed once; the
    /// returned handle is the only way to push on it.
    pub fn producer(self: &Arc<Self>, lane: usize) -> Option<DispatchProducer> {
        if lane >= self.rings.len() || self.claimed[lane].swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(DispatchProducer {
            dispatcher: self.clone(),
            lane,
        })
    }

    /// Number of producer lanes.
    pub fn lanes(&self) -> usize {
        self.rings.len()
    }

    /// Total packets accepted across all lanes.
    pub fn n_sent(&self) -> u64 {
        self.totals().sent
    }

    /// Total packets dropped across all lanes.
    pub fn n_dropped(&self) -> u64 {
        self.totals().dropped
    }

    /// Aggregate counters, summed on read.
    pub fn totals(&self) -> LaneSnapshot {
        aggregate(self.stats.iter().map(|s| &**s))
    }

    /// Zero every lane's counters.
    pub fn reset_counts(&self) {
        for lane in self.stats.iter() {
            lane.reset();
        }
    }

    /// Push the aggregate counters to the process metrics recorder.
    pub fn publish_metrics(&self) {
        crate::stats::publish("dispatch", self.totals());
    }

    #[inline]
    fn drowsy(&self) -> bool {
        self.sleepiness.load(Ordering::Relaxed) >= self.sleep_threshold
    }
}

/// Unique push handle for one producer lane. Not clonable: holding it
/// is what upholds the single-producer contract on the lane's ring.
pub struct DispatchProducer {
    dispatcher: Arc<Dispatcher>,
    lane: usize,
}

impl DispatchProducer {
    /// Enqueue `packet` for the consumer.
    ///
    /// On a full ring the blocking policy spins until the insert
    /// succeeds (waking the consumer if it went idle); the
    /// non-blocking policy releases the packet, counts the drop and
    /// emits a rate-limited diagnostic.
    pub fn push(&mut self, packet: Packet) {
        let d = &*self.dispatcher;
        let ring = &d.rings[self.lane];
        let stats = &d.stats[self.lane];

        match ring.insert(packet) {
            Ok(()) => stats.record_sent(),
            Err(rejected) if d.blocking => {
                // Backpressure: hold the producer until the consumer
                // makes room, waking it if it went idle.
                let mut pending = Some(rejected);
                spin_retry(
                    || match pending.take() {
                        Some(p) => match ring.insert(p) {
                            Ok(()) => true,
                            Err(p) => {
                                pending = Some(p);
                                false
                            }
                        },
                        None => true,
                    },
                    || {
                        if d.drowsy() {
                            d.task.reschedule();
                        }
                    },
                );
                stats.record_sent();
            }
            Err(rejected) => {
                drop(rejected);
                let dropped = stats.record_drop();
                // First 10 drops, then every 100th: keeps loss
                // observable without flooding the log.
                if dropped <= 10 || dropped % 100 == 1 {
                    tracing::warn!(
                        lane = self.lane,
                        dropped,
                        queued = ring.count(),
                        "dispatcher ring full, dropping packet"
                    );
                }
            }
        }

        if d.drowsy() {
            d.task.reschedule();
        }
    }

    /// This handle's lane index.
    pub fn lane(&self) -> usize {
        self.lane
    }
}

/// Unique drain handle: the single consumer of every lane ring.
pub struct DispatchConsumer {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchConsumer {
    /// One consumer-task invocation: drain every lane fully in lane
    /// order, forwarding to `sink`. Returns whether anything was
    /// forwarded.
    ///
    /// Empty invocations raise sleepiness; below the threshold the
    /// task busy-polls via fast reschedule, at the threshold it goes
    /// idle until a push wakes it. Any drained packet resets
    /// sleepiness.
    pub fn run_task(&mut self, sink: &mut dyn FnMut(Packet)) -> bool {
        let d = &*self.dispatcher;
        let mut any = false;
        for ring in d.rings.iter() {
            while let Some(packet) = ring.extract() {
                sink(packet);
                any = true;
            }
        }
        if !any {
            let sleepiness = d.sleepiness.fetch_add(1, Ordering::Relaxed) + 1;
            if sleepiness < d.sleep_threshold {
                d.task.fast_reschedule();
            }
        } else {
            d.sleepiness.store(0, Ordering::Relaxed);
            d.task.fast_reschedule();
        }
        any
    }

    /// The dispatcher this consumer drains.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
