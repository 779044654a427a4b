//! Scheduler - dispatch loop, worker pool and outcome application.
//!
//! # 流れ
//! 1. cycle ごとに環境 snapshot を 1 回だけ取る
//! 2. Pending/Ready かつ eligible なレコードを store から順に読む
//! 3. レコードごとに: 期限切れなら Failed / 制約 OK なら Ready → 空きがあれば Running
//! 4. 実行は別 task。終わったら Decider で次の遷移を決めて store に書く
//!
//! # 排他
//! - 同じ id の二重 dispatch は `running` 表と store の `update` の両方で防ぐ
//! - cycle 全体を覆うロックは持たない（レコード単位の遷移だけがアトミック）

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::app::config::SchedulerConfig;
use crate::app::runner::ExecutionRunner;
use crate::app::status::StateCounts;
use crate::domain::{
    Constraint, Constraints, Decider, Decision, SchedulerError, StoreError, TaskFilter, TaskId,
    TaskRecord, TaskState, Transition,
};
use crate::policy::ConstraintEvaluator;
use crate::ports::{
    Clock, EnvironmentProvider, EnvironmentSnapshot, IdGenerator, PutMode, TaskStore,
};
use crate::typed::Task;

#[cfg(test)]
mod tests;

const WINDOW_EXPIRED: &str = "constraint window expired";
const CANCELLED_BY_CALLER: &str = "cancelled by caller";

/// What a caller enqueues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub task_type: String,
    pub payload: Vec<u8>,
    pub constraints: Constraints,
    /// `None` uses `default_max_attempts` from the config.
    pub max_attempts: Option<u32>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            constraints: Constraints::none(),
            max_attempts: None,
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints = self.constraints.with(constraint);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Summary of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records read from the store.
    pub examined: usize,
    /// Records moved to Running.
    pub dispatched: usize,
    /// Records left waiting (constraints unmet, pool full, or lost a race).
    pub deferred: usize,
    /// Records failed because their `NotAfter` window closed.
    pub expired: usize,
    /// Records skipped because of a store error.
    pub errors: usize,
}

struct RunningHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    runner: ExecutionRunner,
    decider: Arc<dyn Decider>,
    evaluator: ConstraintEvaluator,
    env: Arc<dyn EnvironmentProvider>,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
    config: SchedulerConfig,

    /// 並列度の上限
    semaphore: Arc<Semaphore>,
    /// 実行中の id → cancel token
    running: Mutex<HashMap<TaskId, RunningHandle>>,
    /// 次の cycle を早める（enqueue, 外部 wake, 空きが出たとき）
    wake: Notify,
    /// 実行が 1 つ終わるたびに鳴る
    idle: Notify,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Background task scheduler: an explicit context object, cheap to clone.
///
/// Built with [`SchedulerBuilder`](crate::app::SchedulerBuilder).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        runner: ExecutionRunner,
        decider: Arc<dyn Decider>,
        env: Arc<dyn EnvironmentProvider>,
        clock: Arc<dyn Clock>,
        ids: Box<dyn IdGenerator>,
        config: SchedulerConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                decider,
                evaluator: ConstraintEvaluator::new(),
                env,
                clock,
                ids,
                config,
                semaphore,
                running: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn builder() -> crate::app::SchedulerBuilder {
        crate::app::SchedulerBuilder::new()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    /// Persist a new Pending task and return its id.
    pub async fn enqueue(&self, request: TaskRequest) -> Result<TaskId, SchedulerError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let limit = inner.config.max_payload_bytes;
        if request.payload.len() > limit {
            return Err(SchedulerError::InvalidPayload {
                size: request.payload.len(),
                limit,
            });
        }
        if !inner.runner.registry().contains(&request.task_type) {
            warn!(task_type = %request.task_type, "enqueueing task type with no registered work");
        }

        let id = inner.ids.generate_task_id();
        let max_attempts = request
            .max_attempts
            .unwrap_or(inner.config.default_max_attempts);
        let record = TaskRecord::new(
            id,
            request.task_type,
            request.payload,
            request.constraints,
            max_attempts,
            inner.clock.now(),
        );
        let task_type = record.task_type.clone();
        inner.store.put(record, PutMode::CreateOnly).await?;

        info!(task_id = %id, task_type = %task_type, max_attempts, "task enqueued");
        inner.wake.notify_one();
        Ok(id)
    }

    /// Enqueue a typed task; the payload is its JSON encoding.
    pub async fn enqueue_typed<T: Task>(
        &self,
        task: &T,
        constraints: Constraints,
        max_attempts: Option<u32>,
    ) -> Result<TaskId, SchedulerError> {
        let mut request = TaskRequest::new(T::TYPE, task.encode()?).with_constraints(constraints);
        request.max_attempts = max_attempts;
        self.enqueue(request).await
    }

    pub async fn status(&self, id: TaskId) -> Result<TaskRecord, SchedulerError> {
        Ok(self.inner.store.get(id).await?)
    }

    pub fn list(&self, filter: TaskFilter) -> BoxStream<'_, Result<TaskRecord, StoreError>> {
        self.inner.store.list(filter)
    }

    pub async fn counts(&self) -> Result<StateCounts, SchedulerError> {
        Ok(self.inner.store.counts().await?)
    }

    /// Delete a terminal record.
    pub async fn purge(&self, id: TaskId) -> Result<TaskRecord, SchedulerError> {
        let record = self.inner.store.delete(id).await?;
        info!(task_id = %id, state = %record.state, "task purged");
        Ok(record)
    }

    /// Ask the driving loop for a cycle now (e.g. connectivity changed).
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    /// Number of executions currently in flight in this process.
    pub async fn in_flight(&self) -> usize {
        self.inner.running.lock().await.len()
    }

    /// Wait until no execution is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight().await == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Run one dispatch cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        Ok(self.inner.run_cycle().await)
    }

    /// Cancel a task.
    ///
    /// Returns true if this call moved the task to Cancelled, false if it was
    /// already terminal. A Running task is signalled and its outcome awaited
    /// (bounded by the runner's grace period) before returning; the record
    /// never becomes terminal while its work is still executing.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, SchedulerError> {
        let inner = &self.inner;
        let reason = Some(CANCELLED_BY_CALLER.to_string());
        loop {
            let record = inner.store.get(id).await?;
            if record.is_terminal() {
                return Ok(false);
            }

            if inner.signal_and_wait(id).await {
                let record = inner.store.get(id).await?;
                if record.is_terminal() {
                    info!(task_id = %id, state = %record.state, "running task cancelled");
                    return Ok(record.state == TaskState::Cancelled);
                }
                // 実行側が結果を書けなかった。もう一周して直接 Cancelled にする
                continue;
            }

            let transition = match record.state {
                // ここに実行が無い Running はクラッシュの残骸
                TaskState::Running => Transition::CancelRun {
                    reason: reason.clone(),
                },
                _ => Transition::Cancel {
                    reason: reason.clone(),
                },
            };
            match inner.store.update(id, transition, inner.clock.now()).await {
                Ok(_) => {
                    info!(task_id = %id, "task cancelled");
                    return Ok(true);
                }
                Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                    return Ok(false);
                }
                // 読んだ後に dispatch / retry された。読み直して signal する
                Err(StoreError::InvalidTransition { from, .. }) => {
                    debug!(task_id = %id, state = %from, "task moved during cancel; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Recover interrupted runs and spawn the driving loop.
    ///
    /// Calling `start` twice is a no-op.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let mut driver = inner.driver.lock().await;
        if driver.is_some() {
            return Ok(());
        }

        let recovered = inner.recover_interrupted().await?;
        if recovered > 0 {
            info!(recovered, "interrupted runs moved back to pending");
        }

        let looped = Arc::clone(inner);
        *driver = Some(tokio::spawn(async move { looped.drive().await }));
        info!(
            max_concurrency = inner.config.max_concurrency,
            tick_ms = inner.config.tick_interval_ms,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop the driving loop and wait for in-flight executions to finish.
    ///
    /// In-flight work is not cancelled; new enqueues and cycles are refused.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let driver = inner.driver.lock().await.take();
        if let Some(driver) = driver
            && let Err(e) = driver.await
        {
            warn!(error = %e, "driver loop ended abnormally");
        }
        inner.tracker.close();
        inner.tracker.wait().await;
        info!("scheduler stopped");
    }
}

impl Inner {
    async fn drive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            let report = self.run_cycle().await;
            if report.dispatched > 0 || report.expired > 0 || report.errors > 0 {
                debug!(?report, "dispatch cycle");
            }
        }
        debug!("driver loop exited");
    }

    async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let snapshot = self.env.snapshot();
        let mut report = CycleReport::default();
        let mut records = self.store.list(TaskFilter::dispatchable(snapshot.now));

        while let Some(item) = records.next().await {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "failed to read dispatchable tasks");
                    report.errors += 1;
                    continue;
                }
            };
            report.examined += 1;
            let id = record.id;
            // レコード単位のエラー境界
            if let Err(e) = self.consider(record, &snapshot, &mut report).await {
                match e {
                    StoreError::InvalidTransition { .. } | StoreError::NotYetEligible { .. } => {
                        debug!(task_id = %id, error = %e, "record changed under the cycle");
                        report.deferred += 1;
                    }
                    e => {
                        warn!(task_id = %id, error = %e, "skipping task this cycle");
                        report.errors += 1;
                    }
                }
            }
        }
        report
    }

    async fn consider(
        self: &Arc<Self>,
        record: TaskRecord,
        snapshot: &EnvironmentSnapshot,
        report: &mut CycleReport,
    ) -> Result<(), StoreError> {
        let now = snapshot.now;
        let id = record.id;

        if self.evaluator.window_closed(&record.constraints, now) {
            let transition = Transition::Expire {
                error: WINDOW_EXPIRED.to_string(),
            };
            self.store.update(id, transition, now).await?;
            info!(task_id = %id, "task failed: {WINDOW_EXPIRED}");
            report.expired += 1;
            return Ok(());
        }

        if !self.evaluator.evaluate(&record.constraints, snapshot) {
            if record.state == TaskState::Ready {
                self.store.update(id, Transition::Unready, now).await?;
                debug!(task_id = %id, "constraints lapsed; back to pending");
            }
            report.deferred += 1;
            return Ok(());
        }

        let record = match record.state {
            TaskState::Pending => self.store.update(id, Transition::MarkReady, now).await?,
            _ => record,
        };

        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            debug!(task_id = %id, "worker pool full; task stays ready");
            report.deferred += 1;
            return Ok(());
        };

        if self.dispatch(record, permit, now).await? {
            report.dispatched += 1;
        } else {
            report.deferred += 1;
        }
        Ok(())
    }

    /// Ready → Running and spawn the execution. Returns false if the id is
    /// already in flight in this process.
    async fn dispatch(
        self: &Arc<Self>,
        record: TaskRecord,
        permit: OwnedSemaphorePermit,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = record.id;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut running = self.running.lock().await;
            if running.contains_key(&id) {
                return Ok(false);
            }
            running.insert(
                id,
                RunningHandle {
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
        }

        let record = match self.store.update(id, Transition::Dispatch, now).await {
            Ok(record) => record,
            Err(e) => {
                self.running.lock().await.remove(&id);
                return Err(e);
            }
        };

        debug!(
            task_id = %id,
            task_type = %record.task_type,
            attempt = record.attempt_count + 1,
            "task dispatched"
        );
        let inner = Arc::clone(self);
        self.tracker.spawn(async move {
            inner.execute(record, cancel, permit, done_tx).await;
        });
        Ok(true)
    }

    async fn execute(
        self: Arc<Self>,
        record: TaskRecord,
        cancel: CancellationToken,
        permit: OwnedSemaphorePermit,
        done: watch::Sender<bool>,
    ) {
        let id = record.id;
        let outcome = self.runner.run(&record, cancel.clone()).await;
        let decision = self.decider.decide(&record, &outcome, cancel.is_cancelled());
        let now = self.clock.now();

        let transition = match decision {
            Decision::Succeed { result } => Transition::Succeed { result },
            Decision::Retry { delay, reason } => {
                let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
                Transition::Retry {
                    error: reason,
                    next_eligible_time: now
                        .checked_add_signed(delay)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                }
            }
            Decision::Fail { reason } => Transition::Fail { error: reason },
            Decision::Cancel => Transition::CancelRun {
                reason: outcome
                    .describe()
                    .or_else(|| Some(CANCELLED_BY_CALLER.to_string())),
            },
        };

        match self.persist_outcome(id, transition, now).await {
            Ok(updated) => match updated.state {
                TaskState::Succeeded => {
                    info!(task_id = %id, attempts = updated.attempt_count, "task succeeded")
                }
                TaskState::Pending => warn!(
                    task_id = %id,
                    attempt = updated.attempt_count,
                    next_eligible_time = %updated.next_eligible_time,
                    error = updated.last_error.as_deref().unwrap_or_default(),
                    "task failed; retry scheduled"
                ),
                TaskState::Failed => warn!(
                    task_id = %id,
                    attempts = updated.attempt_count,
                    error = updated.last_error.as_deref().unwrap_or_default(),
                    "task failed"
                ),
                state => info!(task_id = %id, %state, "task finished"),
            },
            // cancel() が先に Cancelled を書いた
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                debug!(task_id = %id, state = %from, "outcome dropped; task already terminal");
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "failed to persist task outcome");
                // Running のまま残さない（attempt には数えない）
                match self.store.update(id, Transition::Interrupted, now).await {
                    Ok(_) => warn!(task_id = %id, "task returned to pending after lost outcome"),
                    Err(e) => error!(task_id = %id, error = %e, "task left running until restart"),
                }
            }
        }

        self.running.lock().await.remove(&id);
        drop(permit);
        let _ = done.send(true);
        self.idle.notify_waiters();
        self.wake.notify_one();
    }

    /// Write an outcome, retrying once on a store error other than an illegal
    /// transition.
    async fn persist_outcome(
        &self,
        id: TaskId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, StoreError> {
        match self.store.update(id, transition.clone(), now).await {
            Err(e) if !matches!(e, StoreError::InvalidTransition { .. }) => {
                warn!(task_id = %id, error = %e, "retrying outcome write");
                self.store.update(id, transition, now).await
            }
            result => result,
        }
    }

    /// Signal a running execution and wait for it to finish. Returns false if
    /// the id is not in flight.
    async fn signal_and_wait(&self, id: TaskId) -> bool {
        let handle = {
            let running = self.running.lock().await;
            running
                .get(&id)
                .map(|h| (h.cancel.clone(), h.done.clone()))
        };
        let Some((cancel, mut done)) = handle else {
            return false;
        };
        cancel.cancel();
        // Sender が落ちた場合も終わったとみなす
        let _ = done.wait_for(|finished| *finished).await;
        true
    }

    /// Running records with no live execution here were interrupted by a
    /// crash or kill; put them back to Pending without counting an attempt.
    async fn recover_interrupted(&self) -> Result<usize, StoreError> {
        let stale: Vec<TaskRecord> = self
            .store
            .list(TaskFilter::in_states([TaskState::Running]))
            .try_collect()
            .await?;

        let now = self.clock.now();
        let mut recovered = 0;
        for record in stale {
            if self.running.lock().await.contains_key(&record.id) {
                continue;
            }
            match self.store.update(record.id, Transition::Interrupted, now).await {
                Ok(_) => {
                    debug!(task_id = %record.id, "recovered interrupted run");
                    recovered += 1;
                }
                Err(e) => warn!(task_id = %record.id, error = %e, "could not recover task"),
            }
        }
        Ok(recovered)
    }
}
