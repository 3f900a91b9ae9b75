//! Per-Thread Counters
//!
//! Lock-free counters kept per producer thread and aggregated on
//! read, so the hot path never shares a cache line across threads.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters owned by one producer lane.
#[derive(Debug, Default)]
pub struct LaneStats {
    /// Packets accepted from this lane.
    pub sent: AtomicU64,
    /// Packets dropped on this lane.
    pub dropped: AtomicU64,
}

impl LaneStats {
    /// Count an accepted packet.
    #[inline(always)]
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dropped packet, returning the new drop total for this
    /// lane.
    #[inline(always)]
    pub fn record_drop(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Non-atomic copy of the current values.
    pub fn snapshot(&self) -> LaneSnapshot {
        LaneSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Zero both counters.
    pub fn reset(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of one lane or an aggregate over lanes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneSnapshot {
    /// Accepted packets.
    pub sent: u64,
    /// Dropped packets.
    pub dropped: u64,
}

/// Sum the counters of every lane.
pub fn aggregate<'a>(lanes: impl IntoIterator<Item = &'a LaneStats>) -> LaneSnapshot {
    let mut total = LaneSnapshot::default();
    for lane in lanes {
        let snap = lane.snapshot();
        total.sent += snap.sent;
        total.dropped += snap.dropped;
    }
    total
}

/// Publish an aggregate snapshot to the process metrics recorder.
pub fn publish(component: &'static str, snap: LaneSnapshot) {
    metrics::counter!(format!("zcio_{component}_sent_total")).absolute(snap.sent);
    metrics::counter!(format!("zcio_{component}_dropped_total")).absolute(snap.dropped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_lanes() {
        let lanes = [LaneStats::default(), LaneStats::default()];
        lanes[0].record_sent();
        lanes[0].record_sent();
        lanes[1].record_sent();
        assert_eq!(lanes[1].record_drop(), 1);

        let total = aggregate(&lanes);
        assert_eq!(total, LaneSnapshot { sent: 3, dropped: 1 });
    }

    #[test]
    fn reset_zeroes_counters() {
        let lane = LaneStats::default();
        lane.record_sent();
        lane.record_drop();
        lane.reset();
        assert_eq!(lane.snapshot(), LaneSnapshot::default());
    }
}
