//! zcio-dataplane - Zero-copy packet movement between NIC rings and
//! software stages
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        ZCIO DATAPLANE                          │
//! │                                                                │
//! │  NIC RX rings ──▶ RxAdapter ───────────▶ downstream stages     │
//! │                    (lease/refill                               │
//! │                     buffer pool)                               │
//! │                                                                │
//! │  producer 0 ─┐                                                 │
//! │  producer 1 ─┼─▶ Dispatcher (ring per producer) ─▶ consumer    │
//! │  producer N ─┘      adaptive poll/idle               task      │
//! │                                                                │
//! │  upstream ──▶ TxAdapter (push: per-thread batch + coarse lock  │
//! │               pull: owning task) ─────────▶ NIC TX rings       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Optimizations
//!
//! 1. **Zero-Copy**: pool buffers are swapped with descriptor slots
//!    instead of copying payloads
//! 2. **Batch Processing**: descriptor cursors advance once per burst,
//!    not per packet
//! 3. **Deferred Synchronization**: ring flushes to hardware are
//!    throttled with a done-flag and backoff, since they are costly
//! 4. **Per-Thread Isolation**: producers get private rings and batch
//!    lists; the only coarse lock guards the shared TX rings

#![warn(missing_docs)]

pub mod device;
pub mod dispatch;
pub mod rx;
pub mod sched;
pub mod stats;
pub mod tx;

pub use device::{DescRing, Device, DeviceConfig, DeviceError, Slot, SLOT_BUF_CHANGED};
pub use dispatch::{DispatchConsumer, DispatchProducer, Dispatcher, DispatcherConfig};
pub use rx::{RxAdapter, RxConfig, RxError};
pub use sched::{spin_retry, NullTask, NullTimer, SyncTimer, TaskHook};
pub use tx::{PacketSource, TxAdapter, TxConfig, TxError, TxPullTask, TxPusher};

/// Maximum packets processed per batch/poll iteration by default.
pub const DEFAULT_BURST: usize = 32;

/// Default per-thread TX internal queue capacity.
pub const DEFAULT_INTERNAL_QUEUE: usize = 512;

/// Default per-producer dispatcher ring capacity.
pub const DEFAULT_DISPATCH_CAPACITY: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        assert!(DEFAULT_INTERNAL_QUEUE >= 2 * DEFAULT_BURST);
        assert!(DEFAULT_DISPATCH_CAPACITY >= DEFAULT_BURST);
    }
}
