//! SQLite-backed task store.
//!
//! - 1 ファイル 1 テーブル (`tasks`)。payload / result は BLOB、constraints は JSON 文字列、
//!   時刻は epoch ミリ秒
//! - `journal_mode=WAL` + `synchronous=FULL`。変更ごとに 1 トランザクションで commit してから返す
//! - rusqlite は同期 API なので、接続は `Mutex` で守り `spawn_blocking` 上で触る

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};

use crate::app::status::StateCounts;
use crate::domain::{
    Constraints, StoreError, TaskFilter, TaskId, TaskRecord, TaskState, Transition,
};
use crate::ports::{Page, PutMode, TaskStore};

const COLUMNS: &str = "id, task_type, payload, constraints, state, attempt_count, max_attempts, \
                       next_eligible_ms, created_ms, updated_ms, last_error, result";

fn backend(context: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("{context}: {err}"))
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Durable [`TaskStore`] on a single SQLite file.
pub struct SqliteTaskStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path` and make sure the schema exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = Path::new(&path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| backend("create parent dir", e))?;
        }
        let conn = Connection::open(&path).map_err(|e| backend("open sqlite db", e))?;
        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| backend("set journal_mode", e))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(path = %path.display(), journal_mode, "sqlite refused WAL journal mode");
        }
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| backend("set synchronous", e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| backend("set busy_timeout", e))?;
        ensure_schema(&conn)?;

        tracing::debug!(path = %path.display(), "sqlite task store opened");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| backend("lock poisoned", "sqlite connection mutex poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| backend("sqlite worker", e))?
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            task_type TEXT NOT NULL,
            payload BLOB NOT NULL,
            constraints TEXT NOT NULL,
            state TEXT NOT NULL,
            attempt_count INTEGER NOT NULL,
            max_attempts INTEGER NOT NULL,
            next_eligible_ms INTEGER NOT NULL,
            created_ms INTEGER NOT NULL,
            updated_ms INTEGER NOT NULL,
            last_error TEXT,
            result BLOB
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_state_eligible
        ON tasks (state, next_eligible_ms);
        ",
    )
    .map_err(|e| backend("ensure schema", e))
}

/// A row as stored, before decoding.
struct RawRow {
    id: String,
    task_type: String,
    payload: Vec<u8>,
    constraints: String,
    state: String,
    attempt_count: i64,
    max_attempts: i64,
    next_eligible_ms: i64,
    created_ms: i64,
    updated_ms: i64,
    last_error: Option<String>,
    result: Option<Vec<u8>>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            payload: row.get(2)?,
            constraints: row.get(3)?,
            state: row.get(4)?,
            attempt_count: row.get(5)?,
            max_attempts: row.get(6)?,
            next_eligible_ms: row.get(7)?,
            created_ms: row.get(8)?,
            updated_ms: row.get(9)?,
            last_error: row.get(10)?,
            result: row.get(11)?,
        })
    }

    fn decode(self) -> Result<TaskRecord, StoreError> {
        let id = self.id;
        let corrupted = |reason: String| StoreError::Corrupted {
            id: id.clone(),
            reason,
        };
        let time = |field: &str, ms: i64| {
            DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| corrupted(format!("{field} out of range: {ms}")))
        };
        let count = |field: &str, n: i64| {
            u32::try_from(n).map_err(|_| corrupted(format!("{field} out of range: {n}")))
        };

        Ok(TaskRecord {
            id: TaskId::from_str(&id).map_err(|e| corrupted(e.to_string()))?,
            task_type: self.task_type,
            payload: self.payload,
            constraints: serde_json::from_str::<Constraints>(&self.constraints)
                .map_err(|e| corrupted(format!("constraints: {e}")))?,
            state: TaskState::from_str(&self.state).map_err(|e| corrupted(e.to_string()))?,
            attempt_count: count("attempt_count", self.attempt_count)?,
            max_attempts: count("max_attempts", self.max_attempts)?,
            next_eligible_time: time("next_eligible_ms", self.next_eligible_ms)?,
            created_at: time("created_ms", self.created_ms)?,
            updated_at: time("updated_ms", self.updated_ms)?,
            last_error: self.last_error,
            result: self.result,
        })
    }
}

fn write_record(conn: &Connection, sql: &str, record: &TaskRecord) -> rusqlite::Result<usize> {
    let constraints = serde_json::to_string(&record.constraints)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        sql,
        params![
            record.id.to_string(),
            record.task_type,
            record.payload,
            constraints,
            record.state.as_str(),
            record.attempt_count,
            record.max_attempts,
            to_ms(record.next_eligible_time),
            to_ms(record.created_at),
            to_ms(record.updated_at),
            record.last_error,
            record.result,
        ],
    )
}

fn select_one(conn: &Connection, id: TaskId) -> Result<Option<RawRow>, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
        params![id.to_string()],
        RawRow::from_row,
    )
    .optional()
    .map_err(|e| backend("select task", e))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn put(&self, record: TaskRecord, mode: PutMode) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let verb = match mode {
                PutMode::Upsert => "INSERT OR REPLACE",
                PutMode::CreateOnly => "INSERT",
            };
            let sql = format!(
                "{verb} INTO tasks ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            );
            match write_record(conn, &sql, &record) {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::DuplicateId(record.id))
                }
                Err(e) => Err(backend("insert task", e)),
            }
        })
        .await
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.with_conn(move |conn| {
            select_one(conn, id)?
                .ok_or(StoreError::NotFound(id))?
                .decode()
        })
        .await
    }

    async fn scan(
        &self,
        filter: &TaskFilter,
        after: Option<TaskId>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut sql = format!("SELECT {COLUMNS} FROM tasks WHERE 1 = 1");
            let mut args: Vec<Value> = Vec::new();

            if let Some(after) = after {
                sql.push_str(" AND id > ?");
                args.push(Value::Text(after.to_string()));
            }
            if let Some(states) = &filter.states {
                if states.is_empty() {
                    return Ok(Page::default());
                }
                let placeholders = vec!["?"; states.len()].join(", ");
                sql.push_str(&format!(" AND state IN ({placeholders})"));
                args.extend(states.iter().map(|s| Value::Text(s.as_str().to_string())));
            }
            if let Some(at) = filter.eligible_by {
                sql.push_str(" AND next_eligible_ms <= ?");
                args.push(Value::Integer(to_ms(at)));
            }
            if let Some(task_type) = &filter.task_type {
                sql.push_str(" AND task_type = ?");
                args.push(Value::Text(task_type.clone()));
            }
            sql.push_str(" ORDER BY id ASC LIMIT ?");
            args.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

            let mut stmt = conn.prepare(&sql).map_err(|e| backend("prepare scan", e))?;
            let rows = stmt
                .query_map(params_from_iter(args), RawRow::from_row)
                .map_err(|e| backend("query scan", e))?;

            let mut page = Page::default();
            let mut examined = 0;
            let mut last_id = None;
            for row in rows {
                let raw = row.map_err(|e| backend("row decode", e))?;
                examined += 1;
                last_id = Some(raw.id.clone());
                // 壊れた行は飛ばす（1 行のせいで一覧全体を止めない）
                match raw.decode() {
                    Ok(record) if filter.matches(&record) => page.records.push(record),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "skipping undecodable task row"),
                }
            }

            if examined == limit
                && let Some(last_id) = last_id
            {
                let next = TaskId::from_str(&last_id).map_err(|e| StoreError::Corrupted {
                    id: last_id.clone(),
                    reason: e.to_string(),
                })?;
                page.next = Some(next);
            }
            Ok(page)
        })
        .await
    }

    async fn update(
        &self,
        id: TaskId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| backend("begin tx", e))?;

            let mut record = select_one(&tx, id)?
                .ok_or(StoreError::NotFound(id))?
                .decode()?;
            record.apply(transition, now)?;

            tx.execute(
                "UPDATE tasks SET state = ?2, attempt_count = ?3, next_eligible_ms = ?4,
                     updated_ms = ?5, last_error = ?6, result = ?7
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    record.state.as_str(),
                    record.attempt_count,
                    to_ms(record.next_eligible_time),
                    to_ms(record.updated_at),
                    record.last_error,
                    record.result,
                ],
            )
            .map_err(|e| backend("update task", e))?;
            tx.commit().map_err(|e| backend("commit tx", e))?;
            Ok(record)
        })
        .await
    }

    async fn delete(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| backend("begin tx", e))?;
            let record = select_one(&tx, id)?
                .ok_or(StoreError::NotFound(id))?
                .decode()?;
            if !record.is_terminal() {
                return Err(StoreError::InvalidState {
                    id,
                    state: record.state,
                });
            }
            tx.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
                .map_err(|e| backend("delete task", e))?;
            tx.commit().map_err(|e| backend("commit tx", e))?;
            Ok(record)
        })
        .await
    }

    async fn counts(&self) -> Result<StateCounts, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .map_err(|e| backend("prepare counts", e))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| backend("query counts", e))?;

            let mut counts = StateCounts::default();
            for row in rows {
                let (state, n) = row.map_err(|e| backend("row decode", e))?;
                let state = TaskState::from_str(&state).map_err(|e| StoreError::Corrupted {
                    id: "*".to_string(),
                    reason: e.to_string(),
                })?;
                counts.add(state, usize::try_from(n).unwrap_or(0));
            }
            Ok(counts)
        })
        .await
    }
}
