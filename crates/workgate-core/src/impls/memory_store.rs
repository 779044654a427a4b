//! In-memory task store.
//!
//! 永続化しない。テストと、再起動をまたぐ必要のない一時的な利用向け。

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::app::status::StateCounts;
use crate::domain::{StoreError, TaskFilter, TaskId, TaskRecord, Transition};
use crate::ports::{Page, PutMode, TaskStore};

/// In-memory store state.
#[derive(Default)]
struct MemoryState {
    /// All task records, ordered by id so scans can page by key.
    records: BTreeMap<TaskId, TaskRecord>,
}

/// Non-durable [`TaskStore`]: everything is lost when the value is dropped.
///
/// A single async mutex guards the map, so every `update` is atomic with
/// respect to every other call.
#[derive(Default)]
pub struct MemoryTaskStore {
    state: Mutex<MemoryState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn put(&self, record: TaskRecord, mode: PutMode) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if mode == PutMode::CreateOnly && state.records.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        state.records.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        let state = self.state.lock().await;
        state
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn scan(
        &self,
        filter: &TaskFilter,
        after: Option<TaskId>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let state = self.state.lock().await;
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };

        let mut page = Page::default();
        let mut examined = 0;
        let mut last = None;
        for (id, record) in state.records.range((lower, Bound::Unbounded)) {
            if examined == limit {
                page.next = last;
                return Ok(page);
            }
            examined += 1;
            last = Some(*id);
            if filter.matches(record) {
                page.records.push(record.clone());
            }
        }
        // 末尾まで読んだ
        page.next = None;
        Ok(page)
    }

    async fn update(
        &self,
        id: TaskId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        // 失敗時に record を汚さないよう、コピーに適用してから差し替える
        let mut next = record.clone();
        next.apply(transition, now)?;
        *record = next.clone();
        Ok(next)
    }

    async fn delete(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.records.get(&id).ok_or(StoreError::NotFound(id))?;
        if !record.is_terminal() {
            return Err(StoreError::InvalidState {
                id,
                state: record.state,
            });
        }
        state.records.remove(&id).ok_or(StoreError::NotFound(id))
    }

    async fn counts(&self) -> Result<StateCounts, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.values().map(|r| r.state).collect())
    }
}
