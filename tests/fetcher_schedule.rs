// tests/fetcher_schedule.rs
//
// Timer-driven behaviour of the scheduled fetcher on a paused tokio clock.
//
// Covered:
// - 3 ticks with success / failure / success
// - auto-stop after max consecutive errors, no further invocations
// - hung fetch bounded by the per-source deadline
// - overlapping run is skipped, not queued
// - external restart after auto-stop
// - zero interval clamped instead of a dead timer

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crawl_daemon::{
    fetch_fn, FetchError, Orchestrator, Payload, PersistenceSink, ScheduledFetcher, Source,
};
use serde_json::json;
use tokio::sync::Notify;

fn sink(dir: &tempfile::TempDir) -> Arc<PersistenceSink> {
    Arc::new(PersistenceSink::new(dir.path()))
}

#[tokio::test(start_paused = true)]
async fn three_ticks_success_failure_success() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let strategy = Arc::new(fetch_fn(move || {
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n == 2 {
                Err(FetchError::Network("boom".into()))
            } else {
                Ok(json!({ "value": 42 }))
            }
        }
    }));
    let source = Source::new("mock", Duration::from_millis(1000));
    let f = Arc::new(ScheduledFetcher::new(source, strategy, sink(&dir), None));

    f.start();
    // ticks at 0ms, 1000ms, 2000ms
    tokio::time::sleep(Duration::from_millis(2500)).await;
    f.stop();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let st = f.state();
    assert_eq!(st.consecutive_errors, 0);
    assert_eq!(st.total_runs, 2);
    assert_eq!(st.total_failures, 1);
    assert_eq!(st.last_result.as_ref().unwrap()["value"], 42);

    let env = PersistenceSink::new(dir.path()).load("mock").unwrap().unwrap();
    assert_eq!(env.data["value"], 42);
}

#[tokio::test(start_paused = true)]
async fn auto_stops_after_max_errors() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let strategy = Arc::new(fetch_fn(move || {
        c.fetch_add(1, Ordering::SeqCst);
        async { Err::<Payload, _>(FetchError::Status { status: 503 }) }
    }));
    let source = Source::new("flaky", Duration::from_secs(1)).with_max_errors(3);
    let f = Arc::new(ScheduledFetcher::new(source, strategy, sink(&dir), None));

    f.start();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!f.is_running());
    assert_eq!(f.state().consecutive_errors, 3);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3, "no runs after auto-stop");
}

#[tokio::test(start_paused = true)]
async fn hung_fetch_hits_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let strategy = Arc::new(fetch_fn(|| async {
        std::future::pending::<Result<Payload, FetchError>>().await
    }));
    let source =
        Source::new("hang", Duration::from_secs(60)).with_timeout(Duration::from_millis(50));
    let f = Arc::new(ScheduledFetcher::new(source, strategy, sink(&dir), None));

    assert!(f.run_once().await.is_none());
    let st = f.state();
    assert_eq!(st.failures.network, 1);
    assert!(st.last_error.unwrap().contains("did not finish"));
}

#[tokio::test]
async fn overlapping_run_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Notify::new());
    let g = Arc::clone(&gate);
    let strategy = Arc::new(fetch_fn(move || {
        let g = Arc::clone(&g);
        async move {
            g.notified().await;
            Ok(json!("done"))
        }
    }));
    let f = Arc::new(ScheduledFetcher::new(
        Source::new("slow", Duration::from_secs(1)),
        strategy,
        sink(&dir),
        None,
    ));

    let f1 = Arc::clone(&f);
    let first = tokio::spawn(async move { f1.run_once().await });
    tokio::task::yield_now().await;

    assert!(f.run_once().await.is_none());
    assert_eq!(f.state().skipped_ticks, 1);
    assert_eq!(f.state().consecutive_errors, 0);

    gate.notify_one();
    assert_eq!(first.await.unwrap(), Some(json!("done")));
    assert_eq!(f.state().total_runs, 1);
}

#[tokio::test(start_paused = true)]
async fn restart_after_auto_stop_runs_again() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let strategy = Arc::new(fetch_fn(move || {
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n <= 2 {
                Err(FetchError::Parse("bad body".into()))
            } else {
                Ok(json!({ "ok": true }))
            }
        }
    }));
    let orch = Orchestrator::new(sink(&dir), None).with_run_all_delay(Duration::ZERO);
    let f = orch.register(
        Source::new("recover", Duration::from_secs(5)).with_max_errors(2),
        strategy,
    );

    f.start();
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(!f.is_running());
    assert_eq!(f.state().failures.parse, 2);

    assert!(orch.restart("recover"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(f.is_running());
    let st = f.state();
    assert_eq!(st.consecutive_errors, 0);
    assert_eq!(st.total_runs, 1);
    f.stop();

    assert!(!orch.restart("unknown"));
}

#[tokio::test(start_paused = true)]
async fn zero_interval_still_polls() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let strategy = Arc::new(fetch_fn(move || {
        c.fetch_add(1, Ordering::SeqCst);
        async { Ok(json!(0)) }
    }));
    let f = Arc::new(ScheduledFetcher::new(
        Source::new("zero", Duration::ZERO),
        strategy,
        sink(&dir),
        None,
    ));

    f.start();
    // clamped to one second: ticks at 0s, 1s, 2s
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(f.is_running());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    f.stop();
}
