//! Work / Handler - タスクを実行する関数の定義
//!
//! - `Work`: object-safe な実行単位。payload はバイト列のまま受け取る
//! - `Handler<T>`: 型付き Task を受け取るハンドラ
//! - `TypedHandler<T, H>`: `Handler<T>` を `Work` に変換する（type erasure）
//! - `from_fn`: async クロージャを `Work` にする

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::task::Task;
use crate::domain::{TaskId, WorkError};

/// 1 回の実行に渡されるコンテキスト
///
/// キャンセルは協調的: work は `is_cancelled` / `cancelled` を安全な地点で確認する。
/// 猶予期間を過ぎても戻らない work は runner に abort される。
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub task_id: TaskId,
    pub task_type: String,

    /// 1-indexed attempt number of this run.
    pub attempt: u32,

    pub payload: Vec<u8>,
    cancel: CancellationToken,
}

impl WorkContext {
    pub fn new(
        task_id: TaskId,
        task_type: impl Into<String>,
        attempt: u32,
        payload: Vec<u8>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            task_type: task_type.into(),
            attempt,
            payload,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation (external cancel or timeout) is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Work は 1 回の attempt を実行して result bytes か WorkError を返す
///
/// # Object Safety
/// - メソッドはジェネリックではない（具体的な型のみ）
/// - `Arc<dyn Work>` として registry に格納できる
#[async_trait]
pub trait Work: Send + Sync {
    async fn execute(&self, ctx: WorkContext) -> Result<Vec<u8>, WorkError>;
}

/// Handler は型付き Task を実行する
///
/// # 使用例
/// ```ignore
/// struct UploadHandler;
///
/// #[async_trait]
/// impl Handler<UploadPhoto> for UploadHandler {
///     async fn handle(&self, task: UploadPhoto, ctx: WorkContext) -> Result<Vec<u8>, WorkError> {
///         upload(&task.path).await.map_err(WorkError::from_error)?;
///         Ok(Vec::new())
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `Handler<UploadPhoto>` は `UploadPhoto` しか受け取れない
/// - コンパイル時に Task と Handler の対応が保証される
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: WorkContext) -> Result<Vec<u8>, WorkError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> Work for TypedHandler<T, H> {
    async fn execute(&self, ctx: WorkContext) -> Result<Vec<u8>, WorkError> {
        // 壊れた payload は何度やり直しても直らない
        let task = T::decode(&ctx.payload).map_err(|e| {
            WorkError::permanent(format!("decode {} payload: {e}", T::TYPE)).with_kind("payload")
        })?;
        self.handler.handle(task, ctx).await
    }
}

/// `Work` backed by an async closure.
pub struct FnWork<F> {
    f: F,
}

pub fn from_fn<F, Fut>(f: F) -> FnWork<F>
where
    F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, WorkError>> + Send + 'static,
{
    FnWork { f }
}

#[async_trait]
impl<F, Fut> Work for FnWork<F>
where
    F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, WorkError>> + Send + 'static,
{
    async fn execute(&self, ctx: WorkContext) -> Result<Vec<u8>, WorkError> {
        (self.f)(ctx).await
    }
}
