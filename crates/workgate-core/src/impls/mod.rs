//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **SqliteTaskStore**: 永続ストア（デフォルト）
//! - **MemoryTaskStore**: テスト用の正本（永続化しない）
//! - **ManualEnvironment**: 手動で状態を切り替える EnvironmentProvider

pub mod manual_environment;
pub mod memory_store;
pub mod sqlite_store;

// 主要な型を再エクスポート
pub use self::manual_environment::ManualEnvironment;
pub use self::memory_store::MemoryTaskStore;
pub use self::sqlite_store::SqliteTaskStore;
