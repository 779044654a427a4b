//! TaskStore port - タスク状態の正本（source of truth）
//!
//! TaskStore は以下を保証します：
//! - `update` は 1 レコード単位でアトミック（同じ id の dispatch を直列化する唯一の場所）
//! - 状態遷移の合法性チェックは `TaskRecord::apply` に委譲する
//! - 永続実装では、呼び出しが返った時点で変更がディスクに書かれている
//!
//! # 実装
//! - **SqliteTaskStore**: 永続（WAL + synchronous=FULL）
//! - **MemoryTaskStore**: テスト用（永続化しない）

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use crate::app::status::StateCounts;
use crate::domain::{StoreError, TaskFilter, TaskId, TaskRecord, Transition};

/// `list` が 1 回の `scan` で取得する件数
pub const LIST_PAGE_SIZE: usize = 128;

/// `put` の書き込みモード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// 既存レコードを置き換える
    Upsert,
    /// 既存 id なら `StoreError::DuplicateId`
    CreateOnly,
}

/// One page of a keyset scan ordered by id.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<TaskRecord>,

    /// Last id examined by this page; `None` once the scan is exhausted.
    ///
    /// May be `Some` even when `records` is empty (every row in the page was
    /// filtered out after decoding).
    pub next: Option<TaskId>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn put(&self, record: TaskRecord, mode: PutMode) -> Result<(), StoreError>;

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError>;

    /// Records matching `filter` with id strictly greater than `after`,
    /// ascending by id, at most `limit` rows examined.
    async fn scan(
        &self,
        filter: &TaskFilter,
        after: Option<TaskId>,
        limit: usize,
    ) -> Result<Page, StoreError>;

    /// Atomically apply `transition` and return the updated record.
    async fn update(
        &self,
        id: TaskId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, StoreError>;

    /// Remove a terminal record, returning it.
    async fn delete(&self, id: TaskId) -> Result<TaskRecord, StoreError>;

    async fn counts(&self) -> Result<StateCounts, StoreError>;

    /// Lazy, finite sequence of matching records, fetched page by page.
    ///
    /// Restart by calling `list` again. Records changed while the stream is
    /// being consumed are seen in whatever state the page read observed.
    fn list(&self, filter: TaskFilter) -> BoxStream<'_, Result<TaskRecord, StoreError>> {
        let cursor = ListCursor {
            filter,
            after: None,
            buffered: VecDeque::new(),
            done: false,
        };
        stream::unfold(cursor, move |mut cursor| async move {
            loop {
                if let Some(record) = cursor.buffered.pop_front() {
                    return Some((Ok(record), cursor));
                }
                if cursor.done {
                    return None;
                }
                match self.scan(&cursor.filter, cursor.after, LIST_PAGE_SIZE).await {
                    Ok(page) => {
                        cursor.buffered.extend(page.records);
                        match page.next {
                            Some(next) => cursor.after = Some(next),
                            None => cursor.done = true,
                        }
                    }
                    Err(e) => {
                        cursor.done = true;
                        return Some((Err(e), cursor));
                    }
                }
            }
        })
        .boxed()
    }
}

struct ListCursor {
    filter: TaskFilter,
    after: Option<TaskId>,
    buffered: VecDeque<TaskRecord>,
    done: bool,
}
