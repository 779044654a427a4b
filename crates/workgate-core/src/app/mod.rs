//! App - アプリケーション層
//!
//! ports と domain を組み合わせてスケジューラを組み立てます。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: 構築とワイヤリング（起動時検証つき）
//! - **Scheduler**: enqueue / status / cancel / dispatch cycle / start / shutdown
//! - **ExecutionRunner**: timeout と cancel を守って work を 1 回実行する
//! - **SchedulerConfig**: TOML で読める設定

pub mod builder;
pub mod config;
pub mod runner;
pub mod scheduler;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, SchedulerBuilder};
pub use self::config::{BackoffConfig, ConfigError, RunnerConfig, SchedulerConfig};
pub use self::runner::ExecutionRunner;
pub use self::scheduler::{CycleReport, Scheduler, TaskRequest};
pub use self::status::StateCounts;
