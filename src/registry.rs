// src/registry.rs
//! Turns `[[sources]]` config entries into registered fetchers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

use crate::budget::BudgetLedger;
use crate::config::{DaemonConfig, SourceConfig, SourceKind};
use crate::crawl::providers::{JsonSource, RssSource};
use crate::crawl::trend::TrendTracker;
use crate::crawl::{Source, SourceFetcher};
use crate::orchestrator::Orchestrator;
use crate::sink::{LearningsLog, PersistenceSink, RemoteCollector};

/// Shared outbound HTTP client for all sources and the collector.
pub fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("crawl-daemon/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("building http client")
}

pub fn source_from_config(cfg: &DaemonConfig, sc: &SourceConfig) -> Source {
    let mut source = Source::new(sc.name.clone(), sc.interval())
        .with_max_errors(sc.max_errors)
        .with_timeout(sc.timeout())
        .with_push_remote(sc.push_remote)
        .with_always_on(cfg.is_always_on(&sc.name));
    source.cost = sc.cost.clone();
    source
}

/// Build the strategy for one entry. `None` when its credentials are missing
/// and the entry demands them.
pub fn strategy_from_config(
    sc: &SourceConfig,
    client: &Client,
    sink: &Arc<PersistenceSink>,
    learnings: &Arc<LearningsLog>,
) -> Option<Arc<dyn SourceFetcher>> {
    let token = sc.auth_token();
    if sc.auth_env.is_some() && token.is_none() {
        if sc.require_auth {
            tracing::warn!(
                source = %sc.name,
                env = sc.auth_env.as_deref().unwrap_or_default(),
                "credentials missing; source skipped"
            );
            return None;
        }
        tracing::info!(source = %sc.name, "credentials missing; fetching unauthenticated");
    }

    let strategy: Arc<dyn SourceFetcher> = match sc.kind {
        SourceKind::Rss => {
            Arc::new(RssSource::from_url(&sc.url, client.clone()).with_limit(sc.limit))
        }
        SourceKind::Json => {
            let trend = sc.trend_field.as_ref().map(|field| {
                TrendTracker::new(sc.name.clone(), field.clone())
                    .with_learnings(Some(Arc::clone(learnings)))
                    .with_baseline(Some(Arc::clone(sink)))
            });
            Arc::new(
                JsonSource::new(&sc.url, client.clone())
                    .with_bearer(token)
                    .with_select(sc.select.clone())
                    .with_limit(sc.limit)
                    .with_trend(trend),
            )
        }
    };
    Some(strategy)
}

/// Assemble sink, ledger and orchestrator from config and register every
/// enabled source.
pub fn build(cfg: &DaemonConfig, client: Client) -> Result<Orchestrator> {
    let collector = cfg
        .collector_url
        .as_ref()
        .map(|url| RemoteCollector::new(url.clone(), client.clone()));
    if collector.is_none() {
        tracing::info!("no collector url configured; remote push disabled");
    }
    let sink = Arc::new(PersistenceSink::new(&cfg.data_dir).with_collector(collector));
    let learnings = Arc::new(LearningsLog::new(
        cfg.learnings_dir(),
        cfg.learnings_max_entries,
    ));
    let ledger = BudgetLedger::open(cfg.budget_dir(), cfg.budget.caps.clone())
        .context("opening budget ledger")?;

    let orch = Orchestrator::new(Arc::clone(&sink), Some(Arc::new(ledger)))
        .with_run_all_delay(cfg.run_all_delay());

    for sc in cfg.sources.iter().filter(|s| s.enabled) {
        let Some(strategy) = strategy_from_config(sc, &client, &sink, &learnings) else {
            continue;
        };
        orch.register(source_from_config(cfg, sc), strategy);
    }

    tracing::info!(sources = orch.len(), data_dir = %cfg.data_dir.display(), "registry built");
    Ok(orch)
}
