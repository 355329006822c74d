use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("crawl_runs_total", "Successful fetch-and-save cycles per source.");
        describe_counter!(
            "crawl_failures_total",
            "Failed cycles per source, labelled by failure kind."
        );
        describe_counter!(
            "crawl_skipped_ticks_total",
            "Ticks skipped because the previous fetch was still in flight."
        );
        describe_counter!(
            "crawl_budget_skips_total",
            "Scheduled runs skipped by the budget pause threshold."
        );
        describe_counter!(
            "sink_push_failures_total",
            "Envelopes the remote collector did not accept."
        );
        describe_gauge!("budget_daily_ratio", "Worst daily spend/cap ratio.");
        describe_gauge!("budget_monthly_ratio", "Worst monthly spend/cap ratio.");
    });
}

impl Metrics {
    /// Install the Prometheus recorder for this process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
