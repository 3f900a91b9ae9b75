//! zcio-core - Shared primitives for zero-copy packet I/O
//!
//! This crate provides the leaf data structures the dataplane is built
//! from:
//!
//! - Bounded rings: lock-free single-producer/single-consumer variants
//!   (compile-time and runtime sized) and a locked variant for
//!   arbitrary sharing
//! - A reference-counted packet view with an intrusive batch list
//!   giving O(1) append
//! - A buffer arena whose slot indices are exchanged with hardware
//!   descriptor rings, with a free-list pool
//!
//! # Design
//!
//! - No allocation on the hot path: rings and arenas are sized up
//!   front
//! - Contention is avoided by partitioning, not by locking; the locked
//!   ring exists for callers that cannot partition
//! - Buffer ownership is exclusive and tracked by index: a slot index
//!   is held by exactly one of the pool, a packet, or a descriptor
//!   slot at any time

#![warn(missing_docs)]

pub mod packet;
pub mod pool;
pub mod ring;

pub use packet::{Packet, PacketAllocError, PacketList};
pub use pool::{BufferArena, PoolBuf, NO_BUF};
pub use ring::{DynamicRing, MtRing, Ring};
