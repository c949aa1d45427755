//! Integration tests driving real worker processes.
//!
//! Every test spawns the `echo-worker` binary built alongside this crate.
//!
//! Run with:
//!   cargo test -p procpool-manager --test pool_integration

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use procpool_core::{ErrorCategory, ErrorKind, Framing, PoolError, SessionId, WorkerId};
use procpool_manager::{
    CheckinOutcome, ExecuteOptions, PoolConfig, PoolEvent, ProcessPool, WorkerKind, WorkerPool,
    WorkerSpec,
};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

/// Upper bound on waiting for an asynchronous pool reaction.
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn worker_spec() -> WorkerSpec {
    let mut spec = WorkerSpec::new(env!("CARGO_BIN_EXE_echo-worker"));
    spec.shutdown_grace_ms = 500;
    spec
}

fn config(pool_size: usize, overflow: usize) -> PoolConfig {
    let mut config = PoolConfig::new(worker_spec());
    config.pool_size = pool_size;
    config.overflow = overflow;
    config
}

fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn wait_for_event<F>(rx: &mut broadcast::Receiver<PoolEvent>, mut matches: F) -> PoolEvent
where
    F: FnMut(&PoolEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for pool event")
}

async fn worker_ids(pool: &ProcessPool) -> HashSet<WorkerId> {
    pool.worker_info()
        .await
        .unwrap()
        .into_iter()
        .filter(|w| w.state.is_live())
        .map(|w| w.id)
        .collect()
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn start_reports_full_pool() {
    let pool = ProcessPool::start(config(2, 0)).await.unwrap();

    let stats = pool.get_stats().await.unwrap();
    assert_eq!(stats.pool_size, 2);
    assert_eq!(stats.available, 2);
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.queued, 0);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn start_fails_when_a_worker_rejects_ping() {
    let mut config = config(2, 0);
    config.worker = worker_spec().with_args(["--reject-ping"]);

    let err = ProcessPool::start(config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WorkerInitFailed);
    assert_eq!(err.category(), ErrorCategory::ResourceError);
}

#[tokio::test]
async fn workers_receive_their_identity() {
    let pool = ProcessPool::start(config(1, 0)).await.unwrap();
    let ids = worker_ids(&pool).await;

    let result = pool
        .execute_anonymous("ping", Map::new(), ExecuteOptions::default())
        .await
        .unwrap();
    let reported: WorkerId = result["worker_id"].as_str().unwrap().parse().unwrap();
    assert!(ids.contains(&reported));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn length_prefixed_framing_round_trips() {
    let mut config = config(1, 0);
    config.worker = worker_spec().with_args(["--framing", "length-prefixed"]);
    config.worker.framing = Framing::LengthPrefixed;

    let pool = ProcessPool::start(config).await.unwrap();
    let payload = args(json!({"text": "line one\nline two", "n": 3}));
    let result = pool
        .execute_anonymous("echo", payload.clone(), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result, payload);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn workers_run_in_configured_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(1, 0);
    config.worker.working_dir = Some(dir.path().to_path_buf());

    let pool = ProcessPool::start(config).await.unwrap();
    let result = pool
        .execute_anonymous("cwd", Map::new(), ExecuteOptions::default())
        .await
        .unwrap();
    let cwd = std::path::PathBuf::from(result["cwd"].as_str().unwrap());
    assert_eq!(
        cwd.canonicalize().unwrap(),
        dir.path().canonicalize().unwrap()
    );

    pool.shutdown().await.unwrap();
}

// =============================================================================
// Checkout
// =============================================================================

#[tokio::test]
async fn concurrent_checkouts_never_share_a_worker() {
    let pool = ProcessPool::start(config(2, 0)).await.unwrap();

    let first = pool.checkout(&ExecuteOptions::default()).await.unwrap();
    let second = pool.checkout(&ExecuteOptions::default()).await.unwrap();
    assert_ne!(first.worker_id(), second.worker_id());
    assert_eq!(pool.get_stats().await.unwrap().busy, 2);

    first.checkin(CheckinOutcome::Success);
    second.checkin(CheckinOutcome::Success);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn queued_callers_are_all_served() {
    let pool = Arc::new(ProcessPool::start(config(2, 0)).await.unwrap());

    let calls = (0..8).map(|i| {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            pool.execute_anonymous("sleep", args(json!({"ms": 50 + i})), ExecuteOptions::default())
                .await
        })
    });
    for call in futures::future::join_all(calls).await {
        assert!(call.unwrap().is_ok());
    }

    let stats = pool.get_stats().await.unwrap();
    assert_eq!(stats.available, 2);
    assert_eq!(stats.queued, 0);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn exhausted_pool_times_out_after_checkout_timeout() {
    let mut config = config(1, 0);
    config.checkout_timeout_ms = 100;
    let pool = ProcessPool::start(config).await.unwrap();
    let held = pool.checkout(&ExecuteOptions::default()).await.unwrap();

    let started = Instant::now();
    let err = pool
        .execute_anonymous("echo", Map::new(), ExecuteOptions::default())
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, PoolError::CheckoutTimeout { .. }));
    let report = err.report();
    assert_eq!(report.category, ErrorCategory::TimeoutError);
    assert_eq!(report.kind, ErrorKind::CheckoutTimeout);
    assert!(waited >= Duration::from_millis(90), "returned too early: {waited:?}");
    assert!(waited < Duration::from_secs(1), "returned too late: {waited:?}");

    held.checkin(CheckinOutcome::Success);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn zero_checkout_timeout_fails_fast() {
    let pool = ProcessPool::start(config(1, 0)).await.unwrap();
    let held = pool.checkout(&ExecuteOptions::default()).await.unwrap();

    let started = Instant::now();
    let options = ExecuteOptions::default().with_checkout_timeout(Duration::ZERO);
    let err = pool.checkout(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CheckoutTimeout);
    assert!(started.elapsed() < Duration::from_millis(100));

    drop(held);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn overflow_worker_absorbs_burst_then_retires() {
    let pool = ProcessPool::start(config(1, 1)).await.unwrap();
    let mut events = pool.subscribe();
    let held = pool.checkout(&ExecuteOptions::default()).await.unwrap();

    let options = ExecuteOptions::default().with_checkout_timeout(Duration::from_secs(5));
    let overflow = pool.checkout(&options).await.unwrap();
    assert_ne!(overflow.worker_id(), held.worker_id());

    let info = pool.worker_info().await.unwrap();
    let kind = info.iter().find(|w| w.id == overflow.worker_id()).map(|w| w.kind);
    assert_eq!(kind, Some(WorkerKind::Overflow));
    assert_eq!(pool.get_stats().await.unwrap().overflow_active, 1);

    let overflow_id = overflow.worker_id();
    overflow.checkin(CheckinOutcome::Success);
    wait_for_event(&mut events, |e| match e {
        PoolEvent::WorkerExited {
            worker_id,
            expected,
            ..
        } => *worker_id == overflow_id && *expected,
        _ => false,
    })
    .await;

    let stats = pool.get_stats().await.unwrap();
    assert_eq!(stats.overflow_active, 0);
    assert_eq!(stats.busy, 1);

    held.checkin(CheckinOutcome::Success);
    pool.shutdown().await.unwrap();
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn externally_killed_worker_is_replaced() {
    let pool = ProcessPool::start(config(2, 0)).await.unwrap();
    let mut events = pool.subscribe();
    let before = worker_ids(&pool).await;

    let victim = pool.worker_info().await.unwrap().remove(0);
    let status = std::process::Command::new("kill")
        .args(["-9", &victim.pid.unwrap().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let event =
        wait_for_event(&mut events, |e| matches!(e, PoolEvent::WorkerReplaced { .. })).await;
    let PoolEvent::WorkerReplaced { old, new } = event else {
        unreachable!();
    };
    assert_eq!(old, victim.id);
    assert!(!before.contains(&new));

    let stats = pool.get_stats().await.unwrap();
    assert_eq!(stats.available, 2);
    let after = worker_ids(&pool).await;
    assert!(!after.contains(&victim.id));
    assert!(after.contains(&new));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn slow_operation_times_out_and_worker_is_replaced() {
    let mut config = config(1, 0);
    config.operation_timeout_ms = 200;
    let pool = ProcessPool::start(config).await.unwrap();
    let mut events = pool.subscribe();
    let before = worker_ids(&pool).await;

    let err = pool
        .execute_anonymous("sleep", args(json!({"ms": 5_000})), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationTimeout);
    assert!(err.is_retriable());

    wait_for_event(&mut events, |e| matches!(e, PoolEvent::WorkerReplaced { .. })).await;
    let after = worker_ids(&pool).await;
    assert_eq!(after.len(), 1);
    assert!(before.is_disjoint(&after));

    // The replacement serves requests.
    pool.execute_anonymous("echo", Map::new(), ExecuteOptions::default())
        .await
        .unwrap();
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn late_reply_after_caller_timeout_is_discarded() {
    let pool = ProcessPool::start(config(1, 0)).await.unwrap();
    let mut handle = pool.checkout(&ExecuteOptions::default()).await.unwrap();

    let err = handle
        .call_with_timeout("sleep", args(json!({"ms": 300})), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationTimeout);

    // The sleep reply arrives first and must not be mistaken for this one.
    let payload = args(json!({"n": 7}));
    let result = handle.call("echo", payload.clone()).await.unwrap();
    assert_eq!(result, payload);

    let worker_id = handle.worker_id();
    handle.checkin(CheckinOutcome::Success);
    assert!(worker_ids(&pool).await.contains(&worker_id));
    assert_eq!(pool.get_stats().await.unwrap().available, 1);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn crash_mid_operation_surfaces_port_closed() {
    let pool = ProcessPool::start(config(1, 0)).await.unwrap();
    let mut events = pool.subscribe();

    let err = pool
        .execute_anonymous("crash", args(json!({"code": 3})), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PortClosed);
    assert_eq!(err.category(), ErrorCategory::CommunicationError);

    wait_for_event(&mut events, |e| matches!(e, PoolEvent::WorkerReplaced { .. })).await;
    assert_eq!(pool.get_stats().await.unwrap().available, 1);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn command_failure_degrades_and_replaces_worker() {
    let pool = ProcessPool::start(config(1, 0)).await.unwrap();
    let mut events = pool.subscribe();

    let err = pool
        .execute_anonymous("fail", args(json!({"message": "bad input"})), ExecuteOptions::default())
        .await
        .unwrap_err();
    match &err {
        PoolError::CommandFailed { message, .. } => assert_eq!(message, "bad input"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.category(), ErrorCategory::WorkerError);

    let event =
        wait_for_event(&mut events, |e| matches!(e, PoolEvent::WorkerDegraded { .. })).await;
    let PoolEvent::WorkerDegraded { reason, .. } = event else {
        unreachable!();
    };
    assert_eq!(reason, "checkin_error");
    wait_for_event(&mut events, |e| matches!(e, PoolEvent::WorkerReplaced { .. })).await;

    pool.execute_anonymous("echo", Map::new(), ExecuteOptions::default())
        .await
        .unwrap();
    pool.shutdown().await.unwrap();
}

// =============================================================================
// Sessions and health
// =============================================================================

#[tokio::test]
async fn session_operations_are_counted() {
    let pool = ProcessPool::start(config(1, 0)).await.unwrap();
    let session = SessionId::new("s1").unwrap();

    for _ in 0..2 {
        pool.execute_in_session(&session, "echo", Map::new(), ExecuteOptions::default())
            .await
            .unwrap();
    }
    pool.execute_anonymous("echo", Map::new(), ExecuteOptions::default())
        .await
        .unwrap();

    let stats = pool.session_stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.sessions[0].session_id, session);
    assert_eq!(stats.sessions[0].operation_count, 2);
    assert_eq!(pool.get_stats().await.unwrap().sessions_active, 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn health_check_passes_on_running_pool() {
    let pool = ProcessPool::start(config(1, 0)).await.unwrap();
    pool.health_check(ExecuteOptions::default()).await.unwrap();

    pool.shutdown().await.unwrap();
    let err = pool.health_check(ExecuteOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolUnavailable);
}

#[tokio::test]
async fn shutdown_stops_every_worker() {
    let pool = ProcessPool::start(config(2, 0)).await.unwrap();
    let mut events = pool.subscribe();

    pool.shutdown().await.unwrap();
    let mut exited = 0;
    while exited < 2 {
        wait_for_event(&mut events, |e| matches!(e, PoolEvent::WorkerExited { expected: true, .. }))
            .await;
        exited += 1;
    }
    assert!(pool.status().is_final());
}
