// tests/orchestrator_budget.rs
//
// Orchestrator coordination and budget gating.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crawl_daemon::budget::ProviderCaps;
use crawl_daemon::{
    fetch_fn, BudgetCaps, BudgetLedger, FetchError, Orchestrator, Payload, PersistenceSink, Source,
    SourceFetcher,
};
use serde_json::json;

fn counting(calls: &Arc<AtomicU32>, value: i64) -> Arc<dyn SourceFetcher> {
    let c = Arc::clone(calls);
    Arc::new(fetch_fn(move || {
        c.fetch_add(1, Ordering::SeqCst);
        async move { Ok(json!({ "value": value })) }
    }))
}

fn ledger(monthly_cap: f64) -> Arc<BudgetLedger> {
    Arc::new(BudgetLedger::in_memory(BudgetCaps {
        monthly_cap: Some(monthly_cap),
        ..BudgetCaps::default()
    }))
}

#[tokio::test(start_paused = true)]
async fn run_all_once_is_sequential_with_delay() {
    let dir = tempfile::tempdir().unwrap();
    let orch = Orchestrator::new(Arc::new(PersistenceSink::new(dir.path())), None)
        .with_run_all_delay(Duration::from_secs(1));

    let calls = Arc::new(AtomicU32::new(0));
    orch.register(Source::new("a", Duration::from_secs(60)), counting(&calls, 1));
    orch.register(Source::new("b", Duration::from_secs(60)), counting(&calls, 2));
    orch.register(
        Source::new("c", Duration::from_secs(60)),
        Arc::new(fetch_fn(|| async {
            Err::<Payload, _>(FetchError::Network("refused".into()))
        })),
    );

    let t0 = tokio::time::Instant::now();
    let summary = orch.run_all_once().await;

    assert_eq!(summary.succeeded, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(summary.failed, vec!["c".to_string()]);
    assert!(summary.skipped.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // two gaps between three sources
    let elapsed = t0.elapsed();
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
}

#[tokio::test]
async fn re_register_replaces_prior_instance() {
    let dir = tempfile::tempdir().unwrap();
    let orch = Orchestrator::new(Arc::new(PersistenceSink::new(dir.path())), None)
        .with_run_all_delay(Duration::ZERO);

    let first = Arc::new(AtomicU32::new(0));
    let second = Arc::new(AtomicU32::new(0));
    let old = orch.register(Source::new("dup", Duration::from_secs(60)), counting(&first, 1));
    old.arm();
    orch.register(Source::new("dup", Duration::from_secs(60)), counting(&second, 2));

    assert_eq!(orch.len(), 1);
    assert!(!old.is_running(), "replaced instance is stopped");

    orch.run_all_once().await;
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(orch.sink().load("dup").unwrap().unwrap().data["value"], 2);
}

#[tokio::test]
async fn paused_budget_skips_all_but_always_on() {
    let dir = tempfile::tempdir().unwrap();
    let budget = ledger(10.0);
    budget.track("twitter", 9.50).unwrap();
    let orch = Orchestrator::new(Arc::new(PersistenceSink::new(dir.path())), Some(budget))
        .with_run_all_delay(Duration::ZERO);

    let calls_discretionary = Arc::new(AtomicU32::new(0));
    let calls_critical = Arc::new(AtomicU32::new(0));
    let discretionary = orch.register(
        Source::new("twitter-trends", Duration::from_secs(60)),
        counting(&calls_discretionary, 1),
    );
    orch.register(
        Source::new("solana-rpc", Duration::from_secs(60)).with_always_on(true),
        counting(&calls_critical, 2),
    );

    let summary = orch.run_all_once().await;

    assert_eq!(calls_discretionary.load(Ordering::SeqCst), 0);
    assert_eq!(calls_critical.load(Ordering::SeqCst), 1);
    assert_eq!(summary.succeeded, vec!["solana-rpc".to_string()]);
    // throttled, not failed
    assert_eq!(summary.skipped, vec!["twitter-trends".to_string()]);
    assert!(summary.failed.is_empty());
    assert_eq!(discretionary.state().budget_skips, 1);
    // a budget skip is not a fetch failure
    assert_eq!(discretionary.state().consecutive_errors, 0);
}

#[tokio::test]
async fn warning_band_is_advisory_only() {
    let dir = tempfile::tempdir().unwrap();
    let budget = ledger(10.0);
    budget.track("twitter", 8.50).unwrap();
    let check = budget.check();
    assert!(check.warning && !check.pause);

    let orch = Orchestrator::new(Arc::new(PersistenceSink::new(dir.path())), Some(budget))
        .with_run_all_delay(Duration::ZERO);
    let calls = Arc::new(AtomicU32::new(0));
    orch.register(Source::new("twitter-trends", Duration::from_secs(60)), counting(&calls, 1));

    orch.run_all_once().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn every_attempt_is_charged_to_the_provider() {
    let dir = tempfile::tempdir().unwrap();
    let mut caps = BudgetCaps::default();
    caps.providers.insert(
        "github".into(),
        ProviderCaps {
            daily: None,
            monthly: Some(1.0),
        },
    );
    let budget = Arc::new(BudgetLedger::in_memory(caps));
    let orch = Orchestrator::new(
        Arc::new(PersistenceSink::new(dir.path())),
        Some(Arc::clone(&budget)),
    )
    .with_run_all_delay(Duration::ZERO);

    let calls = Arc::new(AtomicU32::new(0));
    let f = orch.register(
        Source::new("gh-trending", Duration::from_secs(60)).with_cost("github", 0.25),
        counting(&calls, 1),
    );

    for _ in 0..4 {
        orch.run_all_once().await;
    }
    // 4 x 0.25 reaches the monthly cap; the fifth run is paused
    orch.run_all_once().await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(f.state().budget_skips, 1);
    let report = budget.report();
    assert_eq!(report.providers[0].provider, "github");
    assert!((report.providers[0].monthly - 1.0).abs() < 1e-9);
    assert!(report.check.pause);
}

#[tokio::test(start_paused = true)]
async fn start_all_runs_once_then_each_source_on_its_own_timer() {
    let dir = tempfile::tempdir().unwrap();
    let orch = Orchestrator::new(Arc::new(PersistenceSink::new(dir.path())), None)
        .with_run_all_delay(Duration::ZERO);

    let fast = Arc::new(AtomicU32::new(0));
    let slow = Arc::new(AtomicU32::new(0));
    orch.register(Source::new("fast", Duration::from_secs(1)), counting(&fast, 1));
    orch.register(Source::new("slow", Duration::from_secs(5)), counting(&slow, 2));

    orch.start_all().await;
    assert_eq!(fast.load(Ordering::SeqCst), 1);
    assert_eq!(slow.load(Ordering::SeqCst), 1);

    // fast: +1s,+2s,+3s ; slow: not yet
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(fast.load(Ordering::SeqCst), 4);
    assert_eq!(slow.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(slow.load(Ordering::SeqCst), 2);

    assert_eq!(orch.shutdown(Duration::from_secs(1)).await, 0);
    let status = orch.status();
    assert_eq!(status.sources.len(), 2);
    assert!(status.sources.iter().all(|s| !s.state.running));
    assert!(status.budget.is_none());
}

#[tokio::test]
async fn status_reports_run_state_and_budget() {
    let dir = tempfile::tempdir().unwrap();
    let budget = ledger(100.0);
    let orch = Orchestrator::new(Arc::new(PersistenceSink::new(dir.path())), Some(budget))
        .with_run_all_delay(Duration::ZERO);
    let calls = Arc::new(AtomicU32::new(0));
    orch.register(
        Source::new("polymarket", Duration::from_secs(120)).with_cost("polymarket", 0.5),
        counting(&calls, 9),
    );
    orch.run_all_once().await;

    let status = orch.status();
    let src = &status.sources[0];
    assert_eq!(src.name, "polymarket");
    assert_eq!(src.interval_secs, 120);
    assert_eq!(src.state.total_runs, 1);
    assert!(src.state.last_run.is_some());

    let budget = status.budget.as_ref().expect("budget report");
    assert_eq!(budget.monthly_spend, 0.5);
    assert!(!budget.check.warning);

    let v = serde_json::to_value(&status).unwrap();
    assert_eq!(v["sources"][0]["total_runs"], 1);
    assert!(v["uptime_secs"].is_u64());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tracking_never_undercounts() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(BudgetLedger::open(dir.path(), BudgetCaps::default()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = Arc::clone(&ledger);
        handles.push(tokio::spawn(async move {
            for _ in 0..100 {
                ledger.track("p", 0.01).unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let live = ledger.report();
    assert!((live.monthly_spend - 8.0).abs() < 1e-6, "{}", live.monthly_spend);

    let reopened = BudgetLedger::open(dir.path(), BudgetCaps::default()).unwrap();
    let persisted = reopened.report();
    assert!((persisted.monthly_spend - 8.0).abs() < 1e-6);
    assert_eq!(persisted.providers.len(), 1);
    assert_eq!(persisted.providers[0].provider, "p");
}
