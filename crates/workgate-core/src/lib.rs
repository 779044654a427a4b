//! workgate-core
//!
//! Durable background task scheduling: constraint-gated dispatch, bounded
//! concurrency, timeouts with cooperative cancellation, and retries with
//! exponential backoff.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, constraint, record, outcome, decision, errors）
//! - **policy**: 純粋な判定（BackoffPolicy, ConstraintEvaluator）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator, EnvironmentProvider）
//! - **impls**: 実装（SqliteTaskStore, MemoryTaskStore, ManualEnvironment）
//! - **typed**: 型付き Task API と work の登録（Task, Handler, Work, WorkRegistry）
//! - **app**: スケジューラ本体（SchedulerBuilder, Scheduler, ExecutionRunner, config）

pub mod app;
pub mod domain;
pub mod impls;
pub mod policy;
pub mod ports;
pub mod typed;

pub use app::{Scheduler, SchedulerBuilder, SchedulerConfig, TaskRequest};
pub use domain::{Constraint, Constraints, TaskFilter, TaskId, TaskRecord, TaskState};
