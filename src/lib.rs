// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod budget;
pub mod cli;
pub mod config;
pub mod crawl;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod sink;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::budget::{BudgetCaps, BudgetCheck, BudgetLedger, BudgetReport};
pub use crate::crawl::{
    fetch_fn, FailureKind, FetchError, Payload, RunOutcome, RunState, ScheduledFetcher, Source, SourceFetcher,
};
pub use crate::orchestrator::{Orchestrator, RunAllSummary, StatusSnapshot};
pub use crate::sink::{Envelope, LearningsLog, PersistError, PersistenceSink, RemoteCollector};
