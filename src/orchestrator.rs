// src/orchestrator.rs
//! Owns every scheduled fetcher and the shared budget ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::budget::{BudgetLedger, BudgetReport};
use crate::crawl::{RunOutcome, RunStatus, ScheduledFetcher, Source, SourceFetcher};
use crate::sink::PersistenceSink;

/// Pause between sources in the synchronized pass; several sources share
/// IP-based rate limits upstream.
pub const DEFAULT_RUN_ALL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunAllSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Not attempted this pass (budget pause or fetch already in flight).
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub sources: Vec<RunStatus>,
    pub budget: Option<BudgetReport>,
}

pub struct Orchestrator {
    // registration order is kept so the startup pass is deterministic
    fetchers: RwLock<Vec<Arc<ScheduledFetcher>>>,
    sink: Arc<PersistenceSink>,
    budget: Option<Arc<BudgetLedger>>,
    run_all_delay: Duration,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Orchestrator {
    pub fn new(sink: Arc<PersistenceSink>, budget: Option<Arc<BudgetLedger>>) -> Self {
        Self {
            fetchers: RwLock::new(Vec::new()),
            sink,
            budget,
            run_all_delay: DEFAULT_RUN_ALL_DELAY,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn with_run_all_delay(mut self, delay: Duration) -> Self {
        self.run_all_delay = delay;
        self
    }

    pub fn sink(&self) -> &Arc<PersistenceSink> {
        &self.sink
    }

    pub fn budget(&self) -> Option<&Arc<BudgetLedger>> {
        self.budget.as_ref()
    }

    /// Create the fetcher for `source`. A previous registration under the same
    /// name is stopped and replaced.
    pub fn register(
        &self,
        source: Source,
        strategy: Arc<dyn SourceFetcher>,
    ) -> Arc<ScheduledFetcher> {
        let fetcher = Arc::new(ScheduledFetcher::new(
            source,
            strategy,
            Arc::clone(&self.sink),
            self.budget.clone(),
        ));

        let mut list = self.fetchers.write();
        match list.iter_mut().find(|f| f.name() == fetcher.name()) {
            Some(slot) => {
                slot.stop();
                tracing::info!(source = %fetcher.name(), "source re-registered; replacing");
                *slot = Arc::clone(&fetcher);
            }
            None => {
                tracing::debug!(source = %fetcher.name(), "source registered");
                list.push(Arc::clone(&fetcher));
            }
        }
        fetcher
    }

    pub fn get(&self, name: &str) -> Option<Arc<ScheduledFetcher>> {
        self.fetchers.read().iter().find(|f| f.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.fetchers.read().iter().map(|f| f.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.fetchers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<ScheduledFetcher>> {
        self.fetchers.read().clone()
    }

    /// One budget-gated run per source, strictly sequential with a fixed
    /// delay between sources.
    pub async fn run_all_once(&self) -> RunAllSummary {
        let fetchers = self.snapshot();
        let mut summary = RunAllSummary::default();

        for (i, f) in fetchers.iter().enumerate() {
            if i > 0 && !self.run_all_delay.is_zero() {
                tokio::time::sleep(self.run_all_delay).await;
            }
            let bucket = match f.run_scheduled().await {
                RunOutcome::Saved(_) => &mut summary.succeeded,
                RunOutcome::Failed => &mut summary.failed,
                RunOutcome::Skipped => &mut summary.skipped,
            };
            bucket.push(f.name().to_string());
        }

        tracing::info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            "synchronized pass finished"
        );
        summary
    }

    /// Synchronized first pass, then every source on its own timer.
    pub async fn start_all(&self) -> RunAllSummary {
        let summary = self.run_all_once().await;
        for f in self.snapshot() {
            // a source that tripped its error limit in the first pass stays stopped
            if f.state().consecutive_errors >= f.source().max_errors {
                continue;
            }
            f.arm();
        }
        summary
    }

    pub fn stop_all(&self) {
        for f in self.snapshot() {
            f.stop();
        }
    }

    /// Stop every timer, then give outstanding remote pushes up to `grace`
    /// to finish.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.stop_all();
        self.sink.flush(grace).await
    }

    /// External restart of a stopped (e.g. auto-stopped) source.
    pub fn restart(&self, name: &str) -> bool {
        match self.get(name) {
            Some(f) => {
                f.reset_errors();
                f.start();
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            sources: self.snapshot().iter().map(|f| f.status()).collect(),
            budget: self.budget.as_ref().map(|b| b.report()),
        }
    }
}
