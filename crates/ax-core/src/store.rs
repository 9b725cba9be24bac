use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    merge_json, CommittedTransition, ExecutionFilter, ExecutionRecord, ExecutionState,
    ExecutionStateTransition, JsonMap, Pagination, ProgressPatch, StateChange,
};

// ---------------------------------------------------------------------------
// ExecutionStore trait
// ---------------------------------------------------------------------------

/// Durable storage of execution records and their transition history.
///
/// Every `update_*` method is a single conditional write: it returns
/// `Ok(None)` when no row matched (unknown id or a state precondition that
/// no longer holds) and leaves it to the caller to decide what that means.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, record: &ExecutionRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<ExecutionRecord>>;

    /// Records matching `filter`, newest first, plus the total match count.
    async fn list(
        &self,
        filter: &ExecutionFilter,
        page: Pagination,
    ) -> Result<(Vec<ExecutionRecord>, u64)>;

    /// Compare-and-swap on the state column, committed in the same
    /// transaction as its history row. Writes only when the stored state
    /// equals `change.expected`. Timestamps in the change are set once.
    async fn update_state(&self, id: Uuid, change: StateChange)
        -> Result<Option<CommittedTransition>>;

    /// Writes progress only while the stored state is one of `allowed`.
    async fn update_progress(
        &self,
        id: Uuid,
        patch: ProgressPatch,
        allowed: &[ExecutionState],
    ) -> Result<Option<ExecutionRecord>>;

    /// Stores `result` (when given) and replaces the error message.
    async fn update_result(
        &self,
        id: Uuid,
        result: Option<JsonMap>,
        error_message: Option<String>,
    ) -> Result<Option<ExecutionRecord>>;

    /// Deep-merges `patch` into the stored context.
    async fn merge_context(&self, id: Uuid, patch: JsonMap) -> Result<Option<ExecutionRecord>>;

    /// FAILED -> QUEUED for a retry: bumps `retry_count`, clears the error
    /// and appends history as one write. Matches only while the record is
    /// FAILED with `retry_count == seen_retries`.
    async fn requeue_failed(
        &self,
        id: Uuid,
        seen_retries: u32,
        reason: &str,
    ) -> Result<Option<CommittedTransition>>;

    async fn append_history(
        &self,
        id: Uuid,
        previous: Option<ExecutionState>,
        new_state: ExecutionState,
        reason: &str,
    ) -> Result<ExecutionStateTransition>;

    async fn history(&self, id: Uuid, limit: usize) -> Result<Vec<ExecutionStateTransition>>;

    /// Removes the record and, by cascade, its history.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// helpers – values <-> SQLite
// ---------------------------------------------------------------------------

const RECORD_COLUMNS: &str = "id, agent_id, task_id, state, progress_percentage, status_message,
     input_parameters, context, result, error_message, retry_count,
     created_at, updated_at, started_at, completed_at";

const HISTORY_COLUMNS: &str = "id, execution_id, previous_state, new_state, reason, created_at";

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn uuid_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn state_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<ExecutionState> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn opt_state_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<ExecutionState>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn ts_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn map_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<JsonMap> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_map_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<JsonMap>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn map_to_sql(map: &JsonMap) -> rusqlite::Result<String> {
    serde_json::to_string(map).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let retry_count: i64 = row.get(10)?;
    Ok(ExecutionRecord {
        id: uuid_at(row, 0)?,
        agent_id: uuid_at(row, 1)?,
        task_id: row.get(2)?,
        state: state_at(row, 3)?,
        progress_percentage: row.get(4)?,
        status_message: row.get(5)?,
        input_parameters: map_at(row, 6)?,
        context: map_at(row, 7)?,
        result: opt_map_at(row, 8)?,
        error_message: row.get(9)?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        created_at: ts_at(row, 11)?,
        updated_at: ts_at(row, 12)?,
        started_at: opt_ts_at(row, 13)?,
        completed_at: opt_ts_at(row, 14)?,
    })
}

fn row_to_transition(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionStateTransition> {
    Ok(ExecutionStateTransition {
        id: uuid_at(row, 0)?,
        execution_id: uuid_at(row, 1)?,
        previous_state: opt_state_at(row, 2)?,
        new_state: state_at(row, 3)?,
        reason: row.get(4)?,
        created_at: ts_at(row, 5)?,
    })
}

fn select_record(
    conn: &rusqlite::Connection,
    id: &str,
) -> rusqlite::Result<Option<ExecutionRecord>> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM executions WHERE id = ?1"),
        params![id],
        row_to_record,
    )
    .optional()
}

fn insert_history(
    conn: &rusqlite::Connection,
    row: &ExecutionStateTransition,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO execution_state_transitions ({HISTORY_COLUMNS})
             VALUES (?1,?2,?3,?4,?5,?6)"
        ),
        params![
            row.id.to_string(),
            row.execution_id.to_string(),
            row.previous_state.map(|s| s.as_str()),
            row.new_state.as_str(),
            row.reason,
            ts_to_sql(row.created_at),
        ],
    )?;
    Ok(())
}

fn history_row(
    id: Uuid,
    previous: Option<ExecutionState>,
    new_state: ExecutionState,
    reason: &str,
    at: DateTime<Utc>,
) -> ExecutionStateTransition {
    ExecutionStateTransition {
        id: Uuid::new_v4(),
        execution_id: id,
        previous_state: previous,
        new_state,
        reason: reason.to_string(),
        created_at: at,
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// SqliteExecutionStore
// ---------------------------------------------------------------------------

/// Async SQLite-backed execution store.
///
/// All statements run on the single connection owned by `tokio_rusqlite`,
/// so each `call` closure executes without interleaving with other writers.
/// The state compare-and-swap is still expressed as one
/// `UPDATE .. WHERE id = ? AND state = ?` so it stays atomic on any engine.
pub struct SqliteExecutionStore {
    conn: Connection,
}

impl SqliteExecutionStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS executions (
                        id                  TEXT PRIMARY KEY,
                        agent_id            TEXT NOT NULL,
                        task_id             TEXT NOT NULL,
                        state               TEXT NOT NULL,
                        progress_percentage REAL NOT NULL DEFAULT 0,
                        status_message      TEXT,
                        input_parameters    TEXT NOT NULL,
                        context             TEXT NOT NULL,
                        result              TEXT,
                        error_message       TEXT,
                        retry_count         INTEGER NOT NULL DEFAULT 0,
                        created_at          TEXT NOT NULL,
                        updated_at          TEXT NOT NULL,
                        started_at          TEXT,
                        completed_at        TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_executions_state ON executions(state);
                    CREATE INDEX IF NOT EXISTS idx_executions_agent ON executions(agent_id);

                    CREATE TABLE IF NOT EXISTS execution_state_transitions (
                        id             TEXT PRIMARY KEY,
                        execution_id   TEXT NOT NULL
                                       REFERENCES executions(id) ON DELETE CASCADE,
                        previous_state TEXT,
                        new_state      TEXT NOT NULL,
                        reason         TEXT NOT NULL,
                        created_at     TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_transitions_execution
                        ON execution_state_transitions(execution_id, created_at);
                    ",
                )?;
                Ok(())
            })
            .await?;
        tracing::debug!("execution store schema ready");
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn insert(&self, record: &ExecutionRecord) -> Result<()> {
        let record = record.clone();
        self.conn
            .call(move |conn| {
                let result = record.result.as_ref().map(map_to_sql).transpose()?;
                conn.execute(
                    &format!(
                        "INSERT INTO executions ({RECORD_COLUMNS})
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)"
                    ),
                    params![
                        record.id.to_string(),
                        record.agent_id.to_string(),
                        record.task_id,
                        record.state.as_str(),
                        record.progress_percentage,
                        record.status_message,
                        map_to_sql(&record.input_parameters)?,
                        map_to_sql(&record.context)?,
                        result,
                        record.error_message,
                        i64::from(record.retry_count),
                        ts_to_sql(record.created_at),
                        ts_to_sql(record.updated_at),
                        record.started_at.map(ts_to_sql),
                        record.completed_at.map(ts_to_sql),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExecutionRecord>> {
        let id = id.to_string();
        let record = self
            .conn
            .call(move |conn| Ok(select_record(conn, &id)?))
            .await?;
        Ok(record)
    }

    async fn list(
        &self,
        filter: &ExecutionFilter,
        page: Pagination,
    ) -> Result<(Vec<ExecutionRecord>, u64)> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(agent_id) = filter.agent_id {
            clauses.push("agent_id = ?".into());
            args.push(SqlValue::Text(agent_id.to_string()));
        }
        if let Some(task_id) = &filter.task_id {
            clauses.push("task_id = ?".into());
            args.push(SqlValue::Text(task_id.clone()));
        }
        if !filter.states.is_empty() {
            let marks = vec!["?"; filter.states.len()].join(", ");
            clauses.push(format!("state IN ({marks})"));
            args.extend(
                filter
                    .states
                    .iter()
                    .map(|s| SqlValue::Text(s.as_str().to_string())),
            );
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let limit = clamp_i64(page.limit);
        let offset = clamp_i64(page.offset);

        let page = self
            .conn
            .call(move |conn| {
                let total: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM executions{where_sql}"),
                    rusqlite::params_from_iter(args.iter()),
                    |r| r.get(0),
                )?;

                let mut page_args = args;
                page_args.push(SqlValue::Integer(limit));
                page_args.push(SqlValue::Integer(offset));

                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM executions{where_sql}
                     ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
                ))?;
                let mut rows = stmt.query(rusqlite::params_from_iter(page_args.iter()))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_record(row)?);
                }
                Ok((out, u64::try_from(total).unwrap_or(0)))
            })
            .await?;
        Ok(page)
    }

    async fn update_state(
        &self,
        id: Uuid,
        change: StateChange,
    ) -> Result<Option<CommittedTransition>> {
        let now = Utc::now();
        let transition = history_row(
            id,
            Some(change.expected),
            change.target,
            &change.reason,
            now,
        );
        let id = id.to_string();
        let updated_at = ts_to_sql(now);
        let started_at = change.timestamps.started_at.map(ts_to_sql);
        let completed_at = change.timestamps.completed_at.map(ts_to_sql);

        let committed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE executions
                     SET state = ?1,
                         updated_at = ?2,
                         started_at = COALESCE(started_at, ?3),
                         completed_at = COALESCE(completed_at, ?4)
                     WHERE id = ?5 AND state = ?6",
                    params![
                        change.target.as_str(),
                        updated_at,
                        started_at,
                        completed_at,
                        id,
                        change.expected.as_str(),
                    ],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                insert_history(&tx, &transition)?;
                let record = select_record(&tx, &id)?;
                tx.commit()?;
                Ok(record.map(|record| CommittedTransition { record, transition }))
            })
            .await?;
        Ok(committed)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        patch: ProgressPatch,
        allowed: &[ExecutionState],
    ) -> Result<Option<ExecutionRecord>> {
        let id = id.to_string();
        let allowed = allowed.to_vec();
        let now = ts_to_sql(Utc::now());

        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(mut record) = select_record(&tx, &id)? else {
                    return Ok(None);
                };
                if !allowed.contains(&record.state) {
                    return Ok(None);
                }
                if let Some(context_patch) = patch.context_patch {
                    merge_json(&mut record.context, context_patch);
                }
                tx.execute(
                    "UPDATE executions
                     SET progress_percentage = ?1,
                         status_message = COALESCE(?2, status_message),
                         context = ?3,
                         updated_at = ?4
                     WHERE id = ?5 AND state = ?6",
                    params![
                        patch.percentage,
                        patch.message,
                        map_to_sql(&record.context)?,
                        now,
                        id,
                        record.state.as_str(),
                    ],
                )?;
                let updated = select_record(&tx, &id)?;
                tx.commit()?;
                Ok(updated)
            })
            .await?;
        Ok(updated)
    }

    async fn update_result(
        &self,
        id: Uuid,
        result: Option<JsonMap>,
        error_message: Option<String>,
    ) -> Result<Option<ExecutionRecord>> {
        let id = id.to_string();
        let now = ts_to_sql(Utc::now());

        let updated = self
            .conn
            .call(move |conn| {
                let result = result.as_ref().map(map_to_sql).transpose()?;
                let changed = conn.execute(
                    "UPDATE executions
                     SET result = COALESCE(?1, result),
                         error_message = ?2,
                         updated_at = ?3
                     WHERE id = ?4",
                    params![result, error_message, now, id],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                Ok(select_record(conn, &id)?)
            })
            .await?;
        Ok(updated)
    }

    async fn merge_context(&self, id: Uuid, patch: JsonMap) -> Result<Option<ExecutionRecord>> {
        let id = id.to_string();
        let now = ts_to_sql(Utc::now());

        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(mut record) = select_record(&tx, &id)? else {
                    return Ok(None);
                };
                merge_json(&mut record.context, patch);
                tx.execute(
                    "UPDATE executions SET context = ?1, updated_at = ?2 WHERE id = ?3",
                    params![map_to_sql(&record.context)?, now, id],
                )?;
                let updated = select_record(&tx, &id)?;
                tx.commit()?;
                Ok(updated)
            })
            .await?;
        Ok(updated)
    }

    async fn requeue_failed(
        &self,
        id: Uuid,
        seen_retries: u32,
        reason: &str,
    ) -> Result<Option<CommittedTransition>> {
        let now = Utc::now();
        let transition = history_row(
            id,
            Some(ExecutionState::Failed),
            ExecutionState::Queued,
            reason,
            now,
        );
        let id = id.to_string();
        let updated_at = ts_to_sql(now);

        let committed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE executions
                     SET state = ?1,
                         retry_count = retry_count + 1,
                         error_message = NULL,
                         updated_at = ?2
                     WHERE id = ?3 AND state = ?4 AND retry_count = ?5",
                    params![
                        ExecutionState::Queued.as_str(),
                        updated_at,
                        id,
                        ExecutionState::Failed.as_str(),
                        i64::from(seen_retries),
                    ],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                insert_history(&tx, &transition)?;
                let record = select_record(&tx, &id)?;
                tx.commit()?;
                Ok(record.map(|record| CommittedTransition { record, transition }))
            })
            .await?;
        Ok(committed)
    }

    async fn append_history(
        &self,
        id: Uuid,
        previous: Option<ExecutionState>,
        new_state: ExecutionState,
        reason: &str,
    ) -> Result<ExecutionStateTransition> {
        let row = ExecutionStateTransition {
            id: Uuid::new_v4(),
            execution_id: id,
            previous_state: previous,
            new_state,
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        let insert = row.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO execution_state_transitions ({HISTORY_COLUMNS})
                         VALUES (?1,?2,?3,?4,?5,?6)"
                    ),
                    params![
                        insert.id.to_string(),
                        insert.execution_id.to_string(),
                        insert.previous_state.map(|s| s.as_str()),
                        insert.new_state.as_str(),
                        insert.reason,
                        ts_to_sql(insert.created_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(row)
    }

    async fn history(&self, id: Uuid, limit: usize) -> Result<Vec<ExecutionStateTransition>> {
        let id = id.to_string();
        let limit = clamp_i64(limit as u64);

        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {HISTORY_COLUMNS} FROM execution_state_transitions
                     WHERE execution_id = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2"
                ))?;
                let mut rows = stmt.query(params![id, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_transition(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let id = id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute("DELETE FROM executions WHERE id = ?1", params![id])?;
                Ok(changed > 0)
            })
            .await?;
        Ok(removed)
    }
}
