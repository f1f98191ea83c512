//! Baseband Processing Core
//!
//! The frame-oriented pipeline: windowed buffers, per-frame counters,
//! the master scheduler that turns wire events into dependency-ordered
//! compute tasks, the pinned worker pool that runs them, and the
//! numeric kernels. The transport crate feeds packets in at one end;
//! decoded bits and TX IQ come out the other.

pub mod buffer;
pub mod counter;
pub mod kernel;
pub mod master;
pub mod runtime;
pub mod stats;
pub mod worker;

pub use master::{DecodedFrame, MasterError};
pub use runtime::{Runtime, RuntimeError, RuntimeSummary};
