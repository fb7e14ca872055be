//! Scheduler layer for the runner
//!
//! Long-polls the orchestrator for stages and runs each claimed stage in its
//! own task, bounded by the configured parallelism.

pub mod poller;

pub use poller::StagePoller;
