//! Batch enrichment orchestration for enrichkit.
//!
//! This crate ties the cache, state store, work stack and source adapters
//! together: a [`Pipeline`] drives a [`WorkerPool`] of [`LookupProcessor`]s
//! over a batch and is the only writer of record state.

pub mod context;
pub mod drain;
pub mod import;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod rate_limit;

#[cfg(test)]
mod testing;

pub use context::{MemoryCache, PipelineContext, StopSignal};
pub use drain::{DrainReport, drain_stack, stage_from_stack};
pub use import::{ImportReport, import_file, import_records};
pub use pipeline::{BatchReport, Pipeline, ProgressReporter, SilentProgress, backoff_delay};
pub use pool::{PoolState, Task, TaskOutcome, TaskProcessor, TaskResult, WorkerPool, WorkerState};
pub use processor::{LookupProcessor, fingerprint, validate};
pub use rate_limit::{RateLimiter, RateLimiters};
