use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use futures::TryStreamExt;

use super::*;
use crate::app::config::{BackoffConfig, RunnerConfig};
use crate::app::SchedulerBuilder;
use crate::domain::{FailureKind, WorkError};
use crate::impls::{ManualEnvironment, MemoryTaskStore, SqliteTaskStore};
use crate::ports::FixedClock;
use crate::typed::{Handler, Work, WorkContext, from_fn};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency: 4,
        tick_interval_ms: 20,
        backoff: BackoffConfig {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.0,
        },
        runner: RunnerConfig {
            cancellation_grace_period_ms: 100,
            default_timeout_ms: 5_000,
            ..RunnerConfig::default()
        },
        ..SchedulerConfig::default()
    }
}

struct Harness {
    scheduler: Scheduler,
    clock: Arc<FixedClock>,
    env: Arc<ManualEnvironment>,
}

fn harness_with(
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
    register: impl FnOnce(SchedulerBuilder) -> SchedulerBuilder,
) -> Harness {
    let clock = Arc::new(FixedClock::new(t0()));
    let env = Arc::new(ManualEnvironment::new(clock.clone()));
    let builder = SchedulerBuilder::new()
        .shared_store(store)
        .config(config)
        .clock(clock.clone())
        .environment(env.clone());
    let scheduler = register(builder).build().unwrap();
    Harness {
        scheduler,
        clock,
        env,
    }
}

fn harness(register: impl FnOnce(SchedulerBuilder) -> SchedulerBuilder) -> Harness {
    harness_with(config(), Arc::new(MemoryTaskStore::new()), register)
}

fn ok_work() -> impl Work + 'static {
    from_fn(|ctx: WorkContext| async move { Ok(ctx.payload) })
}

/// Work that blocks until the gate hands out a permit.
fn gated_work(gate: Arc<Semaphore>) -> impl Work + 'static {
    from_fn(move |ctx: WorkContext| {
        let gate = Arc::clone(&gate);
        async move {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| WorkError::retryable(e.to_string()))?;
            Ok(ctx.payload)
        }
    })
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn unconstrained_task_reaches_running_within_one_cycle() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(|b| b.register_work("gated", gated_work(gate.clone())).unwrap());

    let id = h
        .scheduler
        .enqueue(TaskRequest::new("gated", b"hi".to_vec()))
        .await
        .unwrap();
    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.scheduler.status(id).await.unwrap().state, TaskState::Running);

    gate.add_permits(1);
    h.scheduler.wait_idle().await;
    let record = h.scheduler.status(id).await.unwrap();
    assert_eq!(record.state, TaskState::Succeeded);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.result.as_deref(), Some(&b"hi"[..]));
}

#[tokio::test]
async fn always_failing_task_fails_after_max_attempts() {
    let h = harness(|b| {
        b.register_work(
            "flaky",
            from_fn(|_ctx| async { Err(WorkError::retryable("connection reset").with_kind("io")) }),
        )
        .unwrap()
    });
    let id = h
        .scheduler
        .enqueue(TaskRequest::new("flaky", Vec::new()).with_max_attempts(3))
        .await
        .unwrap();

    let mut last_eligible = h.scheduler.status(id).await.unwrap().next_eligible_time;
    for k in 1..=3u32 {
        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.dispatched, 1, "cycle {k}");
        h.scheduler.wait_idle().await;

        let record = h.scheduler.status(id).await.unwrap();
        assert_eq!(record.attempt_count, k);
        assert!(record.next_eligible_time >= last_eligible);
        assert!(record.next_eligible_time >= record.updated_at);
        last_eligible = record.next_eligible_time;

        if k < 3 {
            assert_eq!(record.state, TaskState::Pending);
            // backoff: 1s, 2s
            let expected = TimeDelta::seconds(1 << (k - 1));
            assert_eq!(record.next_eligible_time - record.updated_at, expected);

            // まだ早い
            let early = h.scheduler.run_cycle().await.unwrap();
            assert_eq!(early.dispatched, 0);
            h.clock.advance(Duration::from_secs(60));
        }
    }

    let record = h.scheduler.status(id).await.unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.attempt_count, 3);
    assert!(record.last_error.unwrap().contains("connection reset"));

    // terminal は二度と dispatch されない
    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.scheduler.run_cycle().await.unwrap().dispatched, 0);
}

#[tokio::test]
async fn network_constrained_task_waits_for_connectivity() {
    let h = harness(|b| b.register_work("sync", ok_work()).unwrap());
    h.env.set_network_connected(false);

    let id = h
        .scheduler
        .enqueue(
            TaskRequest::new("sync", Vec::new()).with_constraint(Constraint::NetworkConnected),
        )
        .await
        .unwrap();

    for _ in 0..5 {
        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.deferred, 1);
        h.clock.advance(Duration::from_secs(600));
    }
    assert_eq!(h.scheduler.status(id).await.unwrap().state, TaskState::Pending);

    h.env.set_network_connected(true);
    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.dispatched, 1);
    h.scheduler.wait_idle().await;
    assert_eq!(
        h.scheduler.status(id).await.unwrap().state,
        TaskState::Succeeded
    );
}

#[tokio::test]
async fn ready_task_goes_back_to_pending_when_constraints_lapse() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(
        SchedulerConfig {
            max_concurrency: 1,
            ..config()
        },
        Arc::new(MemoryTaskStore::new()),
        |b| b.register_work("gated", gated_work(gate.clone())).unwrap(),
    );

    let request = TaskRequest::new("gated", Vec::new()).with_constraint(Constraint::Charging);
    let first = h.scheduler.enqueue(request.clone()).await.unwrap();
    let second = h.scheduler.enqueue(request).await.unwrap();

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(h.scheduler.in_flight().await, 1);

    let (running, waiting) = if h.scheduler.status(first).await.unwrap().state == TaskState::Running
    {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(h.scheduler.status(waiting).await.unwrap().state, TaskState::Ready);

    h.env.set_charging(false);
    h.scheduler.run_cycle().await.unwrap();
    assert_eq!(h.scheduler.status(waiting).await.unwrap().state, TaskState::Pending);
    // 実行中のものは制約が外れても止めない
    assert_eq!(h.scheduler.status(running).await.unwrap().state, TaskState::Running);

    gate.add_permits(1);
    h.scheduler.wait_idle().await;
}

#[tokio::test]
async fn pool_limits_concurrent_executions() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(
        SchedulerConfig {
            max_concurrency: 2,
            ..config()
        },
        Arc::new(MemoryTaskStore::new()),
        |b| b.register_work("gated", gated_work(gate.clone())).unwrap(),
    );
    for _ in 0..5 {
        h.scheduler
            .enqueue(TaskRequest::new("gated", Vec::new()))
            .await
            .unwrap();
    }

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.examined, 5);
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.deferred, 3);
    assert_eq!(h.scheduler.in_flight().await, 2);

    gate.add_permits(5);
    h.scheduler.wait_idle().await;
    while h.scheduler.counts().await.unwrap().succeeded < 5 {
        h.scheduler.run_cycle().await.unwrap();
        h.scheduler.wait_idle().await;
    }
    assert_eq!(h.scheduler.counts().await.unwrap().live(), 0);
}

#[tokio::test]
async fn same_id_never_runs_twice_at_once() {
    let active: Arc<StdMutex<HashSet<TaskId>>> = Arc::default();
    let runs: Arc<StdMutex<HashMap<TaskId, usize>>> = Arc::default();
    let overlap = Arc::new(AtomicBool::new(false));

    let work = {
        let (active, runs, overlap) = (active.clone(), runs.clone(), overlap.clone());
        from_fn(move |ctx: WorkContext| {
            let (active, runs, overlap) = (active.clone(), runs.clone(), overlap.clone());
            async move {
                if !active.lock().unwrap().insert(ctx.task_id) {
                    overlap.store(true, Ordering::SeqCst);
                }
                *runs.lock().unwrap().entry(ctx.task_id).or_default() += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.lock().unwrap().remove(&ctx.task_id);
                Ok(Vec::new())
            }
        })
    };
    let h = harness(|b| b.register_work("probe", work).unwrap());

    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(
            h.scheduler
                .enqueue(TaskRequest::new("probe", Vec::new()))
                .await
                .unwrap(),
        );
    }

    // timer と wake が同時に cycle を回す状況を再現
    for _ in 0..50 {
        let cycles = (0..4).map(|_| h.scheduler.run_cycle());
        for report in futures::future::join_all(cycles).await {
            report.unwrap();
        }
        if h.scheduler.counts().await.unwrap().succeeded == ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.scheduler.wait_idle().await;

    assert!(!overlap.load(Ordering::SeqCst));
    let runs = runs.lock().unwrap();
    for id in &ids {
        assert_eq!(runs.get(id), Some(&1), "{id}");
    }
}

#[tokio::test]
async fn cancelling_running_task_ends_cancelled_within_grace() {
    let h = harness(|b| {
        b.register_work(
            "wait",
            from_fn(|ctx: WorkContext| async move {
                ctx.cancelled().await;
                Err(WorkError::cancelled())
            }),
        )
        .unwrap()
    });
    let id = h
        .scheduler
        .enqueue(TaskRequest::new("wait", Vec::new()))
        .await
        .unwrap();
    h.scheduler.run_cycle().await.unwrap();

    let started = Instant::now();
    assert!(h.scheduler.cancel(id).await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(2));

    let record = h.scheduler.status(id).await.unwrap();
    assert_eq!(record.state, TaskState::Cancelled);
    assert_eq!(record.attempt_count, 0);
    assert_eq!(h.scheduler.in_flight().await, 0);

    // terminal: false で変化なし
    assert!(!h.scheduler.cancel(id).await.unwrap());
    assert_eq!(h.scheduler.status(id).await.unwrap(), record);
}

#[tokio::test]
async fn cancelling_stubborn_task_still_ends_cancelled() {
    let h = harness(|b| {
        b.register_work(
            "stubborn",
            from_fn(|_ctx| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Vec::new())
            }),
        )
        .unwrap()
    });
    let id = h
        .scheduler
        .enqueue(TaskRequest::new("stubborn", Vec::new()))
        .await
        .unwrap();
    h.scheduler.run_cycle().await.unwrap();

    let started = Instant::now();
    assert!(h.scheduler.cancel(id).await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(2));

    let record = h.scheduler.status(id).await.unwrap();
    assert_eq!(record.state, TaskState::Cancelled);
    assert!(record.last_error.unwrap().contains("grace_exceeded"));
}

#[tokio::test]
async fn cancelling_pending_task_is_immediate() {
    let h = harness(|b| b.register_work("sync", ok_work()).unwrap());
    h.env.set_network_connected(false);
    let id = h
        .scheduler
        .enqueue(
            TaskRequest::new("sync", Vec::new()).with_constraint(Constraint::NetworkConnected),
        )
        .await
        .unwrap();

    assert!(h.scheduler.cancel(id).await.unwrap());
    h.env.set_network_connected(true);
    assert_eq!(h.scheduler.run_cycle().await.unwrap().dispatched, 0);
    assert_eq!(
        h.scheduler.status(id).await.unwrap().state,
        TaskState::Cancelled
    );
}

#[tokio::test]
async fn permanent_failure_skips_retries() {
    let h = harness(|b| {
        b.register_work(
            "strict",
            from_fn(|_ctx| async { Err(WorkError::permanent("malformed payload")) }),
        )
        .unwrap()
    });
    let id = h
        .scheduler
        .enqueue(TaskRequest::new("strict", Vec::new()).with_max_attempts(5))
        .await
        .unwrap();
    h.scheduler.run_cycle().await.unwrap();
    h.scheduler.wait_idle().await;

    let record = h.scheduler.status(id).await.unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test]
async fn unregistered_task_type_fails_terminally() {
    let h = harness(|b| b);
    let id = h
        .scheduler
        .enqueue(TaskRequest::new("nobody.home.v1", Vec::new()))
        .await
        .unwrap();
    h.scheduler.run_cycle().await.unwrap();
    h.scheduler.wait_idle().await;

    let record = h.scheduler.status(id).await.unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert!(
        record
            .last_error
            .unwrap()
            .starts_with(&FailureKind::UnregisteredWork.to_string())
    );
}

#[tokio::test]
async fn closed_window_fails_without_an_attempt() {
    let h = harness(|b| b.register_work("sync", ok_work()).unwrap());
    h.env.set_network_connected(false);
    let id = h
        .scheduler
        .enqueue(
            TaskRequest::new("sync", Vec::new())
                .with_constraint(Constraint::NetworkConnected)
                .with_constraint(Constraint::NotAfter(t0() + TimeDelta::minutes(1))),
        )
        .await
        .unwrap();

    assert_eq!(h.scheduler.run_cycle().await.unwrap().deferred, 1);
    h.clock.advance(Duration::from_secs(120));
    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.expired, 1);

    let record = h.scheduler.status(id).await.unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.attempt_count, 0);
}

#[tokio::test]
async fn not_before_delays_dispatch() {
    let h = harness(|b| b.register_work("later", ok_work()).unwrap());
    let id = h
        .scheduler
        .enqueue(
            TaskRequest::new("later", Vec::new())
                .with_constraint(Constraint::NotBefore(t0() + TimeDelta::minutes(10))),
        )
        .await
        .unwrap();

    assert_eq!(h.scheduler.run_cycle().await.unwrap().dispatched, 0);
    h.clock.advance(Duration::from_secs(600));
    assert_eq!(h.scheduler.run_cycle().await.unwrap().dispatched, 1);
    h.scheduler.wait_idle().await;
    assert_eq!(
        h.scheduler.status(id).await.unwrap().state,
        TaskState::Succeeded
    );
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let h = harness_with(
        SchedulerConfig {
            max_payload_bytes: 8,
            ..config()
        },
        Arc::new(MemoryTaskStore::new()),
        |b| b,
    );
    let err = h
        .scheduler
        .enqueue(TaskRequest::new("x", vec![0; 9]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::InvalidPayload { size: 9, limit: 8 }
    ));
    assert_eq!(h.scheduler.counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn typed_tasks_round_trip_through_the_scheduler() {
    use crate::typed::task::fixtures::TestTask;

    struct Square;

    #[async_trait::async_trait]
    impl Handler<TestTask> for Square {
        async fn handle(&self, task: TestTask, _ctx: WorkContext) -> Result<Vec<u8>, WorkError> {
            Ok((task.value * task.value).to_string().into_bytes())
        }
    }

    let h = harness(|b| b.register::<TestTask, _>(Square).unwrap());
    let id = h
        .scheduler
        .enqueue_typed(&TestTask { value: 12 }, Constraints::none(), None)
        .await
        .unwrap();
    let record = h.scheduler.status(id).await.unwrap();
    assert_eq!(record.task_type, TestTask::TYPE);
    assert_eq!(record.max_attempts, config().default_max_attempts);

    h.scheduler.run_cycle().await.unwrap();
    h.scheduler.wait_idle().await;
    assert_eq!(
        h.scheduler.status(id).await.unwrap().result.as_deref(),
        Some(&b"144"[..])
    );
}

#[tokio::test]
async fn purge_removes_only_terminal_records() {
    let h = harness(|b| b.register_work("sync", ok_work()).unwrap());
    let id = h
        .scheduler
        .enqueue(TaskRequest::new("sync", Vec::new()))
        .await
        .unwrap();

    assert!(matches!(
        h.scheduler.purge(id).await.unwrap_err(),
        SchedulerError::Store(StoreError::InvalidState { .. })
    ));

    h.scheduler.run_cycle().await.unwrap();
    h.scheduler.wait_idle().await;
    h.scheduler.purge(id).await.unwrap();
    assert!(matches!(
        h.scheduler.status(id).await.unwrap_err(),
        SchedulerError::Store(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn driver_loop_runs_tasks_without_manual_cycles() {
    let h = harness(|b| b.register_work("sync", ok_work()).unwrap());
    h.scheduler.start().await.unwrap();

    let id = h
        .scheduler
        .enqueue(TaskRequest::new("sync", b"x".to_vec()))
        .await
        .unwrap();
    let scheduler = h.scheduler.clone();
    eventually(|| {
        let scheduler = scheduler.clone();
        async move { scheduler.status(id).await.unwrap().state == TaskState::Succeeded }
    })
    .await;

    h.scheduler.shutdown().await;
    assert!(matches!(
        h.scheduler
            .enqueue(TaskRequest::new("sync", Vec::new()))
            .await,
        Err(SchedulerError::ShuttingDown)
    ));
    assert!(matches!(
        h.scheduler.run_cycle().await,
        Err(SchedulerError::ShuttingDown)
    ));
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_work() {
    let finished = Arc::new(AtomicUsize::new(0));
    let work = {
        let finished = finished.clone();
        from_fn(move |_ctx| {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
        })
    };
    let h = harness(|b| b.register_work("slowish", work).unwrap());
    let id = h
        .scheduler
        .enqueue(TaskRequest::new("slowish", Vec::new()))
        .await
        .unwrap();
    h.scheduler.run_cycle().await.unwrap();

    h.scheduler.shutdown().await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.scheduler.status(id).await.unwrap().state,
        TaskState::Succeeded
    );
}

#[tokio::test]
async fn start_recovers_runs_interrupted_by_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    // 前のプロセス: Running のまま落ちた
    let id = {
        let store = SqliteTaskStore::open(&path).unwrap();
        let mut record = TaskRecord::new(
            TaskId::from_ulid(ulid::Ulid::new()),
            "sync",
            b"resume".to_vec(),
            Constraints::none(),
            3,
            t0(),
        );
        record.apply(Transition::MarkReady, t0()).unwrap();
        record.apply(Transition::Dispatch, t0()).unwrap();
        store.put(record.clone(), PutMode::CreateOnly).await.unwrap();
        record.id
    };

    let store = Arc::new(SqliteTaskStore::open(&path).unwrap());
    let h = harness_with(config(), store.clone(), |b| {
        b.register_work("sync", ok_work()).unwrap()
    });
    h.scheduler.start().await.unwrap();

    let scheduler = h.scheduler.clone();
    eventually(|| {
        let scheduler = scheduler.clone();
        async move { scheduler.status(id).await.unwrap().state == TaskState::Succeeded }
    })
    .await;
    h.scheduler.shutdown().await;

    let record = store.get(id).await.unwrap();
    // 中断された run は attempt に数えない
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.result.as_deref(), Some(&b"resume"[..]));
}

#[tokio::test]
async fn state_survives_scheduler_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    let (id, before) = {
        let h = harness_with(
            config(),
            Arc::new(SqliteTaskStore::open(&path).unwrap()),
            |b| {
                b.register_work(
                    "flaky",
                    from_fn(|_ctx| async { Err(WorkError::retryable("eof")) }),
                )
                .unwrap()
            },
        );
        let id = h
            .scheduler
            .enqueue(TaskRequest::new("flaky", b"keep me".to_vec()))
            .await
            .unwrap();
        h.scheduler.run_cycle().await.unwrap();
        h.scheduler.shutdown().await;
        (id, h.scheduler.status(id).await.unwrap())
    };

    let h = harness_with(
        config(),
        Arc::new(SqliteTaskStore::open(&path).unwrap()),
        |b| b,
    );
    let after = h.scheduler.status(id).await.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.payload, b"keep me".to_vec());
    assert_eq!(after.state, TaskState::Pending);
    assert_eq!(after.attempt_count, 1);
    assert_eq!(after, before);

    let listed: Vec<_> = h
        .scheduler
        .list(TaskFilter::in_states([TaskState::Pending]))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(listed, vec![before]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_racing_a_cycle_never_finishes_a_task_under_running_work() {
    let store = Arc::new(MemoryTaskStore::new());
    let early = Arc::new(AtomicUsize::new(0));
    let work = {
        let (store, early) = (store.clone(), early.clone());
        from_fn(move |ctx: WorkContext| {
            let (store, early) = (store.clone(), early.clone());
            async move {
                let result = tokio::select! {
                    _ = ctx.cancelled() => Err(WorkError::cancelled()),
                    _ = tokio::time::sleep(Duration::from_millis(20)) => Ok(Vec::new()),
                };
                // work が動いている間、レコードは Running のまま
                match store.get(ctx.task_id).await {
                    Ok(record) if record.state == TaskState::Running => {}
                    _ => {
                        early.fetch_add(1, Ordering::SeqCst);
                    }
                }
                result
            }
        })
    };
    let h = harness_with(
        SchedulerConfig {
            max_concurrency: 16,
            ..config()
        },
        store.clone(),
        |b| b.register_work("race", work).unwrap(),
    );

    for _ in 0..10 {
        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(
                h.scheduler
                    .enqueue(TaskRequest::new("race", Vec::new()))
                    .await
                    .unwrap(),
            );
        }

        let cycle = {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move { scheduler.run_cycle().await })
        };
        let cancels: Vec<_> = ids
            .iter()
            .map(|&id| {
                let scheduler = h.scheduler.clone();
                tokio::spawn(async move { (id, scheduler.cancel(id).await) })
            })
            .collect();

        cycle.await.unwrap().unwrap();
        for cancel in cancels {
            let (id, cancelled) = cancel.await.unwrap();
            let record = h.scheduler.status(id).await.unwrap();
            if cancelled.unwrap() {
                assert_eq!(record.state, TaskState::Cancelled);
            } else {
                assert_eq!(record.state, TaskState::Succeeded);
            }
        }
        h.scheduler.wait_idle().await;
    }

    assert_eq!(early.load(Ordering::SeqCst), 0);
    assert_eq!(h.scheduler.counts().await.unwrap().live(), 0);
}

/// MemoryTaskStore whose outcome writes fail a given number of times.
struct LossyStore {
    inner: MemoryTaskStore,
    outcome_failures: AtomicUsize,
}

impl LossyStore {
    fn new(outcome_failures: usize) -> Self {
        Self {
            inner: MemoryTaskStore::new(),
            outcome_failures: AtomicUsize::new(outcome_failures),
        }
    }
}

#[async_trait::async_trait]
impl TaskStore for LossyStore {
    async fn put(&self, record: TaskRecord, mode: PutMode) -> Result<(), StoreError> {
        self.inner.put(record, mode).await
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.inner.get(id).await
    }

    async fn scan(
        &self,
        filter: &TaskFilter,
        after: Option<TaskId>,
        limit: usize,
    ) -> Result<crate::ports::Page, StoreError> {
        self.inner.scan(filter, after, limit).await
    }

    async fn update(
        &self,
        id: TaskId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, StoreError> {
        let outcome = matches!(
            transition,
            Transition::Succeed { .. } | Transition::Retry { .. } | Transition::Fail { .. }
        );
        if outcome
            && self
                .outcome_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Backend("disk I/O error".into()));
        }
        self.inner.update(id, transition, now).await
    }

    async fn delete(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.inner.delete(id).await
    }

    async fn counts(&self) -> Result<StateCounts, StoreError> {
        self.inner.counts().await
    }
}

#[tokio::test]
async fn outcome_write_is_retried_once() {
    let h = harness_with(config(), Arc::new(LossyStore::new(1)), |b| {
        b.register_work("sync", ok_work()).unwrap()
    });
    let id = h
        .scheduler
        .enqueue(TaskRequest::new("sync", Vec::new()))
        .await
        .unwrap();
    h.scheduler.run_cycle().await.unwrap();
    h.scheduler.wait_idle().await;

    let record = h.scheduler.status(id).await.unwrap();
    assert_eq!(record.state, TaskState::Succeeded);
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test]
async fn lost_outcome_returns_task_to_pending() {
    let h = harness_with(config(), Arc::new(LossyStore::new(2)), |b| {
        b.register_work("sync", ok_work()).unwrap()
    });
    let id = h
        .scheduler
        .enqueue(TaskRequest::new("sync", Vec::new()))
        .await
        .unwrap();
    h.scheduler.run_cycle().await.unwrap();
    h.scheduler.wait_idle().await;

    let record = h.scheduler.status(id).await.unwrap();
    assert_eq!(record.state, TaskState::Pending);
    assert_eq!(record.attempt_count, 0);
    assert_eq!(h.scheduler.in_flight().await, 0);

    // 再起動を待たずに次の cycle で走る
    assert_eq!(h.scheduler.run_cycle().await.unwrap().dispatched, 1);
    h.scheduler.wait_idle().await;
    assert_eq!(
        h.scheduler.status(id).await.unwrap().state,
        TaskState::Succeeded
    );
}
