//! Backfill engine
//!
//! Job lifecycle, recovery strategies, dedup/rate guards and the background
//! processor that starts queued jobs.

pub mod error;
pub mod guard;
pub mod manager;
pub mod processor;
pub mod store;
pub mod strategy;
pub mod types;

pub use error::BackfillError;
pub use manager::{BackfillManager, EngineSettings, NewJob};
pub use processor::{JobProcessor, TickStats};
pub use store::{BackfillStore, MemoryStore, StoreError};
pub use strategy::{select_strategy, total_batches};
pub use types::{
    BackfillErrorRecord, BackfillJob, BackfillStrategy, DedupPolicy, ErrorCategory, EventFilters,
    JobConfig, JobConfigOverrides, JobFilter, JobProgress, JobStatus, RecoveredEvent, RetryPolicy,
    TimeWindow, TimelineEntry, TimelineKind,
};
