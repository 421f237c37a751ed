//! SQLite-backed task store.
//!
//! The durable coordination substrate: one `tasks` table, all transitions as
//! single conditional `UPDATE`s so claim/reap correctness comes from the
//! database's own atomicity rather than any in-process lock. Timestamps are
//! Unix milliseconds (integer columns compare correctly and cheaply).
//!
//! Connections are opened per call (WAL + busy timeout), and every blocking
//! call is wrapped in `spawn_blocking` for the async trait surface.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::domain::{Error, TaskId, TaskKind, TaskRecord, TaskState, WorkerId};
use crate::observability::QueueCounts;

use super::{LeaseExpiry, ReapOutcome, TaskStore};

const SELECT_COLUMNS: &str = "id, kind, payload, state, attempt_count, max_attempts, claimed_by, \
     created_at_ms, claimed_at_ms, completed_at_ms, next_visible_at_ms, lease_deadline_ms, \
     last_error, dedup_key";

/// Durable `TaskStore` on SQLite.
#[derive(Clone)]
pub struct SqliteTaskStore {
    db_path: PathBuf,
}

impl SqliteTaskStore {
    /// Open (and create if absent) the task database at `dir/tasks.sqlite`.
    pub fn open(dir: &Path) -> Result<Self, Error> {
        let db_path = dir.join("tasks.sqlite");
        let store = Self { db_path };
        let conn = store.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
              id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              payload TEXT NOT NULL,
              state TEXT NOT NULL,
              attempt_count INTEGER NOT NULL DEFAULT 0,
              max_attempts INTEGER NOT NULL,
              claimed_by TEXT,
              created_at_ms INTEGER NOT NULL,
              claimed_at_ms INTEGER,
              completed_at_ms INTEGER,
              next_visible_at_ms INTEGER NOT NULL,
              lease_deadline_ms INTEGER,
              last_error TEXT,
              dedup_key TEXT UNIQUE
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_claimable
              ON tasks(state, next_visible_at_ms, created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_tasks_lease
              ON tasks(state, lease_deadline_ms);
            "#,
        )?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection, Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(conn)
    }

    fn insert_blocking(&self, record: TaskRecord) -> Result<TaskId, Error> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&record.payload)?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO tasks \
             (id, kind, payload, state, attempt_count, max_attempts, claimed_by, \
              created_at_ms, claimed_at_ms, completed_at_ms, next_visible_at_ms, \
              lease_deadline_ms, last_error, dedup_key) \
             VALUES (?,?,?,?,?,?,NULL,?,NULL,NULL,?,NULL,NULL,?)",
            params![
                record.id.as_ulid().to_string(),
                record.kind.as_str(),
                payload,
                record.state.as_str(),
                record.attempt_count,
                record.max_attempts,
                record.created_at.timestamp_millis(),
                record.next_visible_at.timestamp_millis(),
                record.dedup_key,
            ],
        )?;
        if n > 0 {
            return Ok(record.id);
        }
        // dedup_key conflict: hand back the task already enqueued under it.
        let key = record
            .dedup_key
            .as_deref()
            .ok_or_else(|| Error::StoreUnavailable("insert ignored without dedup key".into()))?;
        let existing: String = conn
            .query_row("SELECT id FROM tasks WHERE dedup_key=? LIMIT 1", [key], |r| {
                r.get(0)
            })?;
        parse_task_id(&existing)
    }

    fn get_blocking(&self, id: TaskId) -> Result<Option<TaskRecord>, Error> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE id=? LIMIT 1");
        let raw: Option<RawRow> = conn
            .query_row(&sql, [id.as_ulid().to_string()], RawRow::from_row)
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    fn claim_one_blocking(
        &self,
        worker: WorkerId,
        kinds: Vec<TaskKind>,
        now: DateTime<Utc>,
        lease_deadline: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, Error> {
        let conn = self.conn()?;

        let kind_filter = if kinds.is_empty() {
            String::new()
        } else {
            let placeholders = vec!["?"; kinds.len()].join(",");
            format!("AND kind IN ({placeholders})")
        };
        // Selection and transition in one statement: SQLite applies the
        // subquery and the write atomically, so two workers can never claim
        // the same row.
        let sql = format!(
            "UPDATE tasks SET state='claimed', claimed_by=?, claimed_at_ms=?, \
                 lease_deadline_ms=?, attempt_count=attempt_count+1 \
             WHERE id = ( \
                 SELECT id FROM tasks \
                 WHERE state IN ('pending','retrying') AND next_visible_at_ms <= ? \
                 {kind_filter} \
                 ORDER BY created_at_ms, id LIMIT 1 \
             ) RETURNING {SELECT_COLUMNS}"
        );

        let mut values: Vec<SqlValue> = vec![
            SqlValue::Text(worker.as_ulid().to_string()),
            SqlValue::Integer(now.timestamp_millis()),
            SqlValue::Integer(lease_deadline.timestamp_millis()),
            SqlValue::Integer(now.timestamp_millis()),
        ];
        for kind in &kinds {
            values.push(SqlValue::Text(kind.as_str().to_string()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let raw: Option<RawRow> = stmt
            .query_row(params_from_iter(values), RawRow::from_row)
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    fn mark_running_blocking(&self, id: TaskId, worker: WorkerId) -> Result<(), Error> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET state='running' WHERE id=? AND state='claimed' AND claimed_by=?",
            params![id.as_ulid().to_string(), worker.as_ulid().to_string()],
        )?;
        if n > 0 {
            Ok(())
        } else {
            Err(classify_cas_failure(&conn, id, worker, "claimed")?)
        }
    }

    fn extend_lease_blocking(
        &self,
        id: TaskId,
        worker: WorkerId,
        until: DateTime<Utc>,
    ) -> Result<(), Error> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET lease_deadline_ms=? \
             WHERE id=? AND state IN ('claimed','running') AND claimed_by=?",
            params![
                until.timestamp_millis(),
                id.as_ulid().to_string(),
                worker.as_ulid().to_string()
            ],
        )?;
        if n > 0 {
            Ok(())
        } else {
            Err(classify_cas_failure(&conn, id, worker, "claimed or running")?)
        }
    }

    fn mark_succeeded_blocking(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET state='succeeded', completed_at_ms=?, \
                 claimed_by=NULL, lease_deadline_ms=NULL \
             WHERE id=? AND state IN ('claimed','running') AND claimed_by=?",
            params![
                now.timestamp_millis(),
                id.as_ulid().to_string(),
                worker.as_ulid().to_string()
            ],
        )?;
        if n > 0 {
            Ok(())
        } else {
            Err(classify_cas_failure(&conn, id, worker, "claimed or running")?)
        }
    }

    fn mark_retrying_blocking(
        &self,
        id: TaskId,
        worker: WorkerId,
        next_visible_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), Error> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET state='retrying', next_visible_at_ms=?, last_error=?, \
                 claimed_by=NULL, lease_deadline_ms=NULL \
             WHERE id=? AND state IN ('claimed','running') AND claimed_by=?",
            params![
                next_visible_at.timestamp_millis(),
                error,
                id.as_ulid().to_string(),
                worker.as_ulid().to_string()
            ],
        )?;
        if n > 0 {
            Ok(())
        } else {
            Err(classify_cas_failure(&conn, id, worker, "claimed or running")?)
        }
    }

    fn mark_terminal_blocking(
        &self,
        id: TaskId,
        worker: WorkerId,
        state: TaskState,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), Error> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET state=?, completed_at_ms=?, last_error=COALESCE(?, last_error), \
                 claimed_by=NULL, lease_deadline_ms=NULL \
             WHERE id=? AND state IN ('claimed','running') AND claimed_by=?",
            params![
                state.as_str(),
                now.timestamp_millis(),
                error,
                id.as_ulid().to_string(),
                worker.as_ulid().to_string()
            ],
        )?;
        if n > 0 {
            Ok(())
        } else {
            Err(classify_cas_failure(&conn, id, worker, "claimed or running")?)
        }
    }

    fn cancel_blocking(&self, id: TaskId, now: DateTime<Utc>) -> Result<(), Error> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET state='abandoned', completed_at_ms=?, last_error='cancelled' \
             WHERE id=? AND state IN ('pending','retrying')",
            params![now.timestamp_millis(), id.as_ulid().to_string()],
        )?;
        if n > 0 {
            return Ok(());
        }
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM tasks WHERE id=? LIMIT 1",
                [id.as_ulid().to_string()],
                |r| r.get(0),
            )
            .optional()?;
        match state {
            None => Err(Error::NotFound(id)),
            Some(s) => Err(Error::InvalidState {
                task_id: id,
                state: parse_state(&s)?,
                expected: "pending or retrying",
            }),
        }
    }

    fn expired_leases_blocking(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LeaseExpiry>, Error> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, lease_deadline_ms, attempt_count, max_attempts FROM tasks \
             WHERE state IN ('claimed','running') \
               AND lease_deadline_ms IS NOT NULL AND lease_deadline_ms <= ? \
             ORDER BY lease_deadline_ms LIMIT ?",
        )?;
        let mut rows = stmt.query(params![now.timestamp_millis(), limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let deadline_ms: i64 = row.get(1)?;
            out.push(LeaseExpiry {
                task_id: parse_task_id(&id)?,
                observed_deadline: ms_to_datetime(deadline_ms)?,
                attempt_count: row.get(2)?,
                max_attempts: row.get(3)?,
            });
        }
        Ok(out)
    }

    fn apply_reap_blocking(
        &self,
        id: TaskId,
        observed_deadline: DateTime<Utc>,
        outcome: ReapOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let conn = self.conn()?;
        // The lease_deadline_ms equality predicate is the apply-time
        // re-check: a heartbeat that landed since the sweep changes the
        // deadline and voids this update.
        let n = match outcome {
            ReapOutcome::Retry { next_visible_at } => conn.execute(
                "UPDATE tasks SET state='retrying', next_visible_at_ms=?, \
                     last_error='lease expired', claimed_by=NULL, lease_deadline_ms=NULL \
                 WHERE id=? AND state IN ('claimed','running') AND lease_deadline_ms=?",
                params![
                    next_visible_at.timestamp_millis(),
                    id.as_ulid().to_string(),
                    observed_deadline.timestamp_millis()
                ],
            )?,
            ReapOutcome::Abandon => conn.execute(
                "UPDATE tasks SET state='abandoned', completed_at_ms=?, \
                     last_error='lease expired', claimed_by=NULL, lease_deadline_ms=NULL \
                 WHERE id=? AND state IN ('claimed','running') AND lease_deadline_ms=?",
                params![
                    now.timestamp_millis(),
                    id.as_ulid().to_string(),
                    observed_deadline.timestamp_millis()
                ],
            )?,
        };
        Ok(n > 0)
    }

    fn counts_blocking(&self) -> Result<QueueCounts, Error> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(1) FROM tasks GROUP BY state")?;
        let mut rows = stmt.query([])?;
        let mut counts = QueueCounts::default();
        while let Some(row) = rows.next()? {
            let state: String = row.get(0)?;
            let n: i64 = row.get(1)?;
            counts.add(parse_state(&state)?, n as usize);
        }
        Ok(counts)
    }
}

/// Raw column values; converted to the domain record outside the rusqlite
/// row closure so parse failures map to our error type.
struct RawRow {
    id: String,
    kind: String,
    payload: String,
    state: String,
    attempt_count: u32,
    max_attempts: u32,
    claimed_by: Option<String>,
    created_at_ms: i64,
    claimed_at_ms: Option<i64>,
    completed_at_ms: Option<i64>,
    next_visible_at_ms: i64,
    lease_deadline_ms: Option<i64>,
    last_error: Option<String>,
    dedup_key: Option<String>,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            payload: row.get(2)?,
            state: row.get(3)?,
            attempt_count: row.get(4)?,
            max_attempts: row.get(5)?,
            claimed_by: row.get(6)?,
            created_at_ms: row.get(7)?,
            claimed_at_ms: row.get(8)?,
            completed_at_ms: row.get(9)?,
            next_visible_at_ms: row.get(10)?,
            lease_deadline_ms: row.get(11)?,
            last_error: row.get(12)?,
            dedup_key: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, Error> {
        let claimed_by = self
            .claimed_by
            .as_deref()
            .map(parse_worker_id)
            .transpose()?;
        Ok(TaskRecord {
            id: parse_task_id(&self.id)?,
            kind: TaskKind::new(self.kind),
            payload: serde_json::from_str(&self.payload)?,
            state: parse_state(&self.state)?,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            claimed_by,
            created_at: ms_to_datetime(self.created_at_ms)?,
            claimed_at: self.claimed_at_ms.map(ms_to_datetime).transpose()?,
            completed_at: self.completed_at_ms.map(ms_to_datetime).transpose()?,
            next_visible_at: ms_to_datetime(self.next_visible_at_ms)?,
            lease_deadline: self.lease_deadline_ms.map(ms_to_datetime).transpose()?,
            last_error: self.last_error,
            dedup_key: self.dedup_key,
        })
    }
}

/// A conditional update matched no row: figure out which contract error to
/// surface. Read-only classification is safe here, the CAS itself has
/// already failed.
fn classify_cas_failure(
    conn: &Connection,
    id: TaskId,
    worker: WorkerId,
    expected: &'static str,
) -> Result<Error, Error> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT state, claimed_by FROM tasks WHERE id=? LIMIT 1",
            [id.as_ulid().to_string()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        None => Ok(Error::NotFound(id)),
        Some((state, claimed_by)) => {
            let state = parse_state(&state)?;
            if state.is_owned() && claimed_by.as_deref() != Some(&worker.as_ulid().to_string()) {
                Ok(Error::NotOwner {
                    task_id: id,
                    worker_id: worker,
                })
            } else {
                Ok(Error::InvalidState {
                    task_id: id,
                    state,
                    expected,
                })
            }
        }
    }
}

fn parse_task_id(s: &str) -> Result<TaskId, Error> {
    TaskId::from_str(s).map_err(|e| Error::StoreUnavailable(format!("corrupt task id {s}: {e}")))
}

fn parse_worker_id(s: &str) -> Result<WorkerId, Error> {
    WorkerId::from_str(s)
        .map_err(|e| Error::StoreUnavailable(format!("corrupt worker id {s}: {e}")))
}

fn parse_state(s: &str) -> Result<TaskState, Error> {
    TaskState::from_str(s).map_err(Error::StoreUnavailable)
}

fn ms_to_datetime(ms: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::StoreUnavailable(format!("timestamp out of range: {ms}")))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<TaskId, Error> {
        let store = self.clone();
        spawn(move || store.insert_blocking(record)).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, Error> {
        let store = self.clone();
        spawn(move || store.get_blocking(id)).await
    }

    async fn claim_one(
        &self,
        worker: WorkerId,
        kinds: &[TaskKind],
        now: DateTime<Utc>,
        lease_deadline: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, Error> {
        let store = self.clone();
        let kinds = kinds.to_vec();
        spawn(move || store.claim_one_blocking(worker, kinds, now, lease_deadline)).await
    }

    async fn mark_running(&self, id: TaskId, worker: WorkerId) -> Result<(), Error> {
        let store = self.clone();
        spawn(move || store.mark_running_blocking(id, worker)).await
    }

    async fn extend_lease(
        &self,
        id: TaskId,
        worker: WorkerId,
        until: DateTime<Utc>,
    ) -> Result<(), Error> {
        let store = self.clone();
        spawn(move || store.extend_lease_blocking(id, worker, until)).await
    }

    async fn mark_succeeded(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let store = self.clone();
        spawn(move || store.mark_succeeded_blocking(id, worker, now)).await
    }

    async fn mark_retrying(
        &self,
        id: TaskId,
        worker: WorkerId,
        next_visible_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), Error> {
        let store = self.clone();
        spawn(move || store.mark_retrying_blocking(id, worker, next_visible_at, error)).await
    }

    async fn mark_terminal(
        &self,
        id: TaskId,
        worker: WorkerId,
        state: TaskState,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), Error> {
        let store = self.clone();
        spawn(move || store.mark_terminal_blocking(id, worker, state, now, error)).await
    }

    async fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<(), Error> {
        let store = self.clone();
        spawn(move || store.cancel_blocking(id, now)).await
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LeaseExpiry>, Error> {
        let store = self.clone();
        spawn(move || store.expired_leases_blocking(now, limit)).await
    }

    async fn apply_reap(
        &self,
        id: TaskId,
        observed_deadline: DateTime<Utc>,
        outcome: ReapOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let store = self.clone();
        spawn(move || store.apply_reap_blocking(id, observed_deadline, outcome, now)).await
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, Error> {
        let store = self.clone();
        spawn(move || store.counts_blocking()).await
    }
}

async fn spawn<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, Error> + Send + 'static,
) -> Result<T, Error> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::StoreUnavailable(format!("blocking task join: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn open_store() -> (tempfile::TempDir, SqliteTaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTaskStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn pending(kind: &str, created_at: DateTime<Utc>) -> TaskRecord {
        TaskRecord::new(
            TaskId::generate(),
            TaskKind::new(kind),
            serde_json::json!({"k": kind}),
            3,
            created_at,
            created_at,
        )
    }

    #[tokio::test]
    async fn insert_get_round_trip() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let payload = serde_json::json!({"barcode": "3017620422003", "lang": "fr"});
        let mut rec = pending("predict", now);
        rec.payload = payload.clone();
        let id = rec.id;

        store.insert(rec).await.unwrap();
        let loaded = store.get(id).await.unwrap().unwrap();

        assert_eq!(loaded.id, id);
        assert_eq!(loaded.payload, payload);
        assert_eq!(loaded.state, TaskState::Pending);
        assert_eq!(loaded.attempt_count, 0);
    }

    #[tokio::test]
    async fn dedup_key_is_idempotent() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let id1 = store
            .insert(pending("sync", now).with_dedup_key("sync@t0"))
            .await
            .unwrap();
        let id2 = store
            .insert(pending("sync", now).with_dedup_key("sync@t0"))
            .await
            .unwrap();

        assert_eq!(id1, id2);
        assert_eq!(store.counts_by_state().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn counts_aggregate_per_state() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        for i in 0..3 {
            store
                .insert(pending("a", now - TimeDelta::seconds(i)))
                .await
                .unwrap();
        }
        store
            .claim_one(WorkerId::generate(), &[], now, now + TimeDelta::seconds(30))
            .await
            .unwrap()
            .unwrap();

        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.claimed, 1);
    }

    #[tokio::test]
    async fn claim_is_fifo_and_increments_attempts() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let older = pending("a", now - TimeDelta::seconds(30));
        let older_id = older.id;
        store.insert(pending("a", now)).await.unwrap();
        store.insert(older).await.unwrap();

        let claimed = store
            .claim_one(WorkerId::generate(), &[], now, now + TimeDelta::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, older_id);
        assert_eq!(claimed.state, TaskState::Claimed);
        assert_eq!(claimed.attempt_count, 1);
    }

    #[tokio::test]
    async fn claim_respects_kind_and_visibility() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let mut delayed = pending("a", now);
        delayed.next_visible_at = now + TimeDelta::seconds(60);
        store.insert(delayed).await.unwrap();
        store.insert(pending("b", now)).await.unwrap();

        let worker = WorkerId::generate();
        assert!(
            store
                .claim_one(worker, &[TaskKind::new("a")], now, now)
                .await
                .unwrap()
                .is_none()
        );
        let claimed = store
            .claim_one(worker, &[TaskKind::new("a"), TaskKind::new("b")], now, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.kind.as_str(), "b");
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store.insert(pending("a", now)).await.unwrap();

        let (s1, s2) = (store.clone(), store.clone());
        let lease = now + TimeDelta::seconds(30);
        let (a, b) = tokio::join!(
            s1.claim_one(WorkerId::generate(), &[], now, lease),
            s2.claim_one(WorkerId::generate(), &[], now, lease),
        );
        let wins = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|r| r.is_some())
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn owner_checks_are_enforced() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store.insert(pending("a", now)).await.unwrap();

        let owner = WorkerId::generate();
        let claimed = store
            .claim_one(owner, &[], now, now + TimeDelta::seconds(30))
            .await
            .unwrap()
            .unwrap();

        let err = store
            .mark_succeeded(claimed.id, WorkerId::generate(), now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotOwner { .. }));

        store.mark_running(claimed.id, owner).await.unwrap();
        store.mark_succeeded(claimed.id, owner, now).await.unwrap();

        // Terminal states reject further transitions.
        let err = store.mark_succeeded(claimed.id, owner, now).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn retry_then_reclaim_carries_error() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store.insert(pending("a", now)).await.unwrap();

        let worker = WorkerId::generate();
        let claimed = store
            .claim_one(worker, &[], now, now + TimeDelta::seconds(30))
            .await
            .unwrap()
            .unwrap();
        store
            .mark_retrying(claimed.id, worker, now + TimeDelta::seconds(4), "boom".into())
            .await
            .unwrap();

        let later = now + TimeDelta::seconds(4);
        let reclaimed = store
            .claim_one(worker, &[], later, later + TimeDelta::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempt_count, 2);
        assert_eq!(reclaimed.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn reap_apply_rechecks_deadline() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store.insert(pending("a", now)).await.unwrap();

        let worker = WorkerId::generate();
        let deadline = now + TimeDelta::seconds(10);
        let claimed = store.claim_one(worker, &[], now, deadline).await.unwrap().unwrap();

        let sweep_at = now + TimeDelta::seconds(11);
        let expired = store.expired_leases(sweep_at, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task_id, claimed.id);

        // Heartbeat between sweep and apply: reap must lose.
        store
            .extend_lease(claimed.id, worker, now + TimeDelta::seconds(60))
            .await
            .unwrap();
        let applied = store
            .apply_reap(
                claimed.id,
                expired[0].observed_deadline,
                ReapOutcome::Retry {
                    next_visible_at: sweep_at,
                },
                sweep_at,
            )
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(
            store.get(claimed.id).await.unwrap().unwrap().state,
            TaskState::Claimed
        );
    }

    #[tokio::test]
    async fn reap_applies_once() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store.insert(pending("a", now)).await.unwrap();

        let worker = WorkerId::generate();
        let deadline = now + TimeDelta::seconds(10);
        store.claim_one(worker, &[], now, deadline).await.unwrap().unwrap();

        let sweep_at = now + TimeDelta::seconds(11);
        let expired = store.expired_leases(sweep_at, 10).await.unwrap();
        let expiry = &expired[0];

        let outcome = ReapOutcome::Retry {
            next_visible_at: sweep_at,
        };
        let first = store
            .apply_reap(expiry.task_id, expiry.observed_deadline, outcome.clone(), sweep_at)
            .await
            .unwrap();
        let second = store
            .apply_reap(expiry.task_id, expiry.observed_deadline, outcome, sweep_at)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(
            store.get(expiry.task_id).await.unwrap().unwrap().state,
            TaskState::Retrying
        );
    }
}
