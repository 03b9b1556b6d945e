//! Fan-out managers that drive a pool of workers against one request.
//!
//! A manager owns N slots (N = min(parallelism, work units)), each slot
//! a proxy over its own worker process. Units of work are handed out
//! from a shared queue; a slot that finishes a unit immediately takes
//! the next one. The caller's sink sees every streamed frame verbatim,
//! minus each slot's terminal completion frame, and exactly one
//! aggregated terminal event once every slot has drained.

pub mod discovery;
pub mod execution;

pub use discovery::ParallelDiscoveryManager;
pub use execution::ParallelExecutionManager;

pub(crate) fn slot_count(parallelism: usize, units: usize) -> usize {
    parallelism.max(1).min(units)
}
