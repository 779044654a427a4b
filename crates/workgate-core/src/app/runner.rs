//! ExecutionRunner - 1 回の attempt を実行して Outcome を返す
//!
//! - work function は `run` 1 回につき高々 1 回だけ呼ぶ（専用の tokio task で）
//! - timeout は task_type ごと。超えたら work に cancel を通知し、猶予期間だけ待つ
//! - 外部 cancel も同じく猶予期間だけ待ち、戻らなければ abort して GraceExceeded
//! - panic は retryable な失敗として扱う

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::config::RunnerConfig;
use crate::domain::{FailureKind, Outcome, TaskRecord, WorkError};
use crate::typed::{WorkContext, WorkRegistry};

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
}

pub struct ExecutionRunner {
    registry: Arc<WorkRegistry>,
    config: RunnerConfig,
}

impl ExecutionRunner {
    pub fn new(registry: Arc<WorkRegistry>, config: RunnerConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &WorkRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one attempt of `record`.
    ///
    /// `cancel` is the external cancellation signal. The work function sees a
    /// child token that is also cancelled on timeout.
    pub async fn run(&self, record: &TaskRecord, cancel: CancellationToken) -> Outcome {
        let Some(work) = self.registry.get(&record.task_type) else {
            return Outcome::failure(
                FailureKind::UnregisteredWork,
                format!("no work registered for task type '{}'", record.task_type),
                false,
            );
        };

        let attempt = record.attempt_count.saturating_add(1);
        let work_token = cancel.child_token();
        let ctx = WorkContext::new(
            record.id,
            record.task_type.clone(),
            attempt,
            record.payload.clone(),
            work_token.clone(),
        );
        let timeout = self.config.timeout_for(&record.task_type);
        let grace = self.config.grace_period();

        debug!(task_id = %record.id, task_type = %record.task_type, attempt, "running work");
        let mut handle = tokio::spawn(async move { work.execute(ctx).await });

        let interrupt = tokio::select! {
            biased;
            joined = &mut handle => return finished(joined),
            _ = cancel.cancelled() => Interrupt::Cancelled,
            _ = tokio::time::sleep(timeout) => Interrupt::TimedOut(timeout),
        };

        work_token.cancel();
        let yielded = tokio::time::timeout(grace, &mut handle).await.is_ok();
        if !yielded {
            handle.abort();
            warn!(
                task_id = %record.id,
                grace_ms = grace.as_millis() as u64,
                "work did not yield within the grace period; aborted"
            );
        }

        match interrupt {
            Interrupt::Cancelled if yielded => Outcome::Cancelled,
            Interrupt::Cancelled => Outcome::failure(
                FailureKind::GraceExceeded,
                format!("work did not yield within {grace:?} of cancellation"),
                true,
            ),
            Interrupt::TimedOut(after) => {
                warn!(task_id = %record.id, timeout_ms = after.as_millis() as u64, "work timed out");
                Outcome::failure(
                    FailureKind::Timeout,
                    format!("attempt exceeded {after:?}"),
                    true,
                )
            }
        }
    }
}

fn finished(joined: Result<Result<Vec<u8>, WorkError>, JoinError>) -> Outcome {
    match joined {
        Ok(Ok(result)) => Outcome::success(result),
        Ok(Err(err)) => Outcome::from(err),
        Err(err) if err.is_panic() => Outcome::failure(
            FailureKind::Panicked,
            panic_message(err.into_panic()),
            true,
        ),
        Err(err) => Outcome::failure(FailureKind::Work("aborted".into()), err.to_string(), true),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "work panicked".to_string()
    }
}
