//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部のもの（永続化、時刻、ID 生成、デバイス状態）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - スケジューラは時刻も環境も port 経由でしか見ない（テストで差し替え可能）

pub mod clock;
pub mod environment;
pub mod id_generator;
pub mod task_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::environment::{EnvironmentProvider, EnvironmentSnapshot};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{Page, PutMode, TaskStore, LIST_PAGE_SIZE};
