//! Typed - 型付き Task API と work function の登録
//!
//! このモジュールは task_type の typo を型で排除し、
//! Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `Work` trait - object-safe, バイト列 payload

pub mod handler;
pub mod registry;
pub mod task;

// 主要な trait/型 を再エクスポート
pub use self::handler::{FnWork, Handler, TypedHandler, Work, WorkContext, from_fn};
pub use self::registry::{RegistryError, WorkRegistry};
pub use self::task::Task;
