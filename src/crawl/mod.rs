// src/crawl/mod.rs
pub mod fetcher;
pub mod providers;
pub mod trend;
pub mod types;

pub use fetcher::{FailureCounts, RunOutcome, RunState, RunStatus, ScheduledFetcher};
pub use types::{
    fetch_fn, CostSpec, FailureKind, FetchError, FnFetcher, Payload, Source, SourceFetcher,
};
