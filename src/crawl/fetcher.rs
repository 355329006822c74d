// src/crawl/fetcher.rs
//! Scheduled fetcher: the polling unit for one `Source`.
//!
//! State machine: STOPPED -> RUNNING (`start`/`arm`) -> STOPPED (`stop`, or
//! automatically once `consecutive_errors` reaches `max_errors`).
//! At most one fetch per source is in flight; a tick that finds the previous
//! fetch unresolved is skipped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use crate::budget::BudgetLedger;
use crate::crawl::types::{
    FailureKind, FetchError, Payload, Source, SourceFetcher, MIN_INTERVAL,
};
use crate::sink::PersistenceSink;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureCounts {
    pub network: u64,
    pub parse: u64,
    pub persistence: u64,
}

impl FailureCounts {
    fn bump(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Network => self.network += 1,
            FailureKind::Parse => self.parse += 1,
            FailureKind::Persistence => self.persistence += 1,
        }
    }
}

/// Result of one cycle as seen by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Saved(Payload),
    Failed,
    /// Not attempted: budget pause or a fetch still in flight.
    Skipped,
}

impl RunOutcome {
    pub fn into_payload(self) -> Option<Payload> {
        match self {
            RunOutcome::Saved(p) => Some(p),
            RunOutcome::Failed | RunOutcome::Skipped => None,
        }
    }
}

/// Mutable per-source counters. Only the fetcher writes them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunState {
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub total_runs: u64,
    pub total_failures: u64,
    pub failures: FailureCounts,
    pub skipped_ticks: u64,
    pub budget_skips: u64,
    pub last_error: Option<String>,
    pub last_result: Option<Payload>,
}

/// Read-only view handed out for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    pub name: String,
    pub interval_secs: u64,
    pub max_errors: u32,
    pub always_on: bool,
    #[serde(flatten)]
    pub state: RunState,
}

pub struct ScheduledFetcher {
    source: Source,
    strategy: Arc<dyn SourceFetcher>,
    sink: Arc<PersistenceSink>,
    budget: Option<Arc<BudgetLedger>>,
    state: Mutex<RunState>,
    in_flight: tokio::sync::Mutex<()>,
    // dropping the sender ends the timer loop
    stop_tx: Mutex<Option<watch::Sender<()>>>,
}

impl ScheduledFetcher {
    pub fn new(
        source: Source,
        strategy: Arc<dyn SourceFetcher>,
        sink: Arc<PersistenceSink>,
        budget: Option<Arc<BudgetLedger>>,
    ) -> Self {
        Self {
            source,
            strategy,
            sink,
            budget,
            state: Mutex::new(RunState::default()),
            in_flight: tokio::sync::Mutex::new(()),
            stop_tx: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn state(&self) -> RunState {
        self.state.lock().clone()
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            name: self.source.name.clone(),
            interval_secs: self.source.interval.as_secs(),
            max_errors: self.source.max_errors,
            always_on: self.source.always_on,
            state: self.state(),
        }
    }

    /// One polling cycle. Failures are counted and logged, never returned.
    pub async fn run_once(&self) -> Option<Payload> {
        self.run_cycle().await.into_payload()
    }

    async fn run_cycle(&self) -> RunOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            self.state.lock().skipped_ticks += 1;
            counter!("crawl_skipped_ticks_total", "source" => self.source.name.clone())
                .increment(1);
            tracing::warn!(source = %self.source.name, "previous fetch still in flight; skipping tick");
            return RunOutcome::Skipped;
        };

        let started = Utc::now();
        self.charge_budget();

        let outcome = match time::timeout(self.source.timeout, self.strategy.fetch()).await {
            Ok(Ok(payload)) => match self.sink.save(&self.source.name, &payload) {
                Ok(envelope) => Ok((payload, envelope)),
                Err(e) => Err(FetchError::from(e)),
            },
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FetchError::Timeout(self.source.timeout)),
        };

        match outcome {
            Ok((payload, envelope)) => {
                {
                    let mut st = self.state.lock();
                    st.last_run = Some(started);
                    st.last_success = Some(started);
                    st.consecutive_errors = 0;
                    st.total_runs += 1;
                    st.last_error = None;
                    st.last_result = Some(payload.clone());
                }
                counter!("crawl_runs_total", "source" => self.source.name.clone()).increment(1);
                tracing::info!(source = %self.source.name, "fetch saved");

                if self.source.push_remote {
                    self.sink.spawn_push(envelope);
                }
                RunOutcome::Saved(payload)
            }
            Err(e) => {
                self.record_failure(started, &e);
                RunOutcome::Failed
            }
        }
    }

    fn record_failure(&self, started: DateTime<Utc>, e: &FetchError) {
        let kind = e.kind();
        let tripped = {
            let mut st = self.state.lock();
            st.last_run = Some(started);
            st.consecutive_errors += 1;
            st.total_failures += 1;
            st.failures.bump(kind);
            st.last_error = Some(e.to_string());
            st.consecutive_errors >= self.source.max_errors
        };
        counter!(
            "crawl_failures_total",
            "source" => self.source.name.clone(),
            "kind" => kind.as_str()
        )
        .increment(1);
        tracing::warn!(error = %e, kind = kind.as_str(), source = %self.source.name, "fetch failed");

        if tripped {
            tracing::error!(
                source = %self.source.name,
                max_errors = self.source.max_errors,
                "too many consecutive errors; stopping source"
            );
            self.stop();
        }
    }

    fn charge_budget(&self) {
        let (Some(ledger), Some(cost)) = (&self.budget, &self.source.cost) else {
            return;
        };
        if let Err(e) = ledger.track(&cost.provider, cost.per_call) {
            tracing::warn!(error = %e, source = %self.source.name, "failed to persist budget ledger");
        }
    }

    /// Budget-gated run used for every scheduled tick.
    pub async fn run_scheduled(&self) -> RunOutcome {
        if let Some(ledger) = &self.budget {
            if !ledger.admits(&self.source.name, self.source.always_on) {
                self.state.lock().budget_skips += 1;
                counter!("crawl_budget_skips_total", "source" => self.source.name.clone())
                    .increment(1);
                return RunOutcome::Skipped;
            }
        }
        self.run_cycle().await
    }

    /// Run immediately, then every `interval`. No-op while running.
    pub fn start(self: &Arc<Self>) {
        self.spawn_loop(true);
    }

    /// Arm the timer without the immediate run; the first run happens one
    /// interval from now. No-op while running.
    pub fn arm(self: &Arc<Self>) {
        self.spawn_loop(false);
    }

    fn spawn_loop(self: &Arc<Self>, immediate: bool) {
        let mut rx = {
            let mut slot = self.stop_tx.lock();
            if slot.is_some() {
                tracing::debug!(source = %self.source.name, "already running");
                return;
            }
            let (tx, rx) = watch::channel(());
            *slot = Some(tx);
            self.state.lock().running = true;
            rx
        };

        let this = Arc::clone(self);
        let period = self.source.interval.max(MIN_INTERVAL);
        tracing::info!(source = %this.source.name, interval_secs = period.as_secs(), "source started");

        tokio::spawn(async move {
            let first = if immediate {
                time::Instant::now()
            } else {
                time::Instant::now() + period
            };
            let mut ticker = time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        // `stop` only cancels future ticks; this run completes.
                        this.run_scheduled().await;
                    }
                }
            }
            tracing::debug!(source = %this.source.name, "timer loop exited");
        });
    }

    /// Clear the consecutive error count, e.g. before an external restart.
    pub fn reset_errors(&self) {
        self.state.lock().consecutive_errors = 0;
    }

    /// Cancel future ticks. Idempotent; an in-flight fetch still completes.
    pub fn stop(&self) {
        let had = self.stop_tx.lock().take().is_some();
        self.state.lock().running = false;
        if had {
            tracing::info!(source = %self.source.name, "source stopped");
        }
    }
}
