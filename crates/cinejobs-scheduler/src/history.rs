//! Execution history store: the durable audit trail of every job attempt.
//!
//! One row per physical attempt. A row is opened `Running` by [`HistoryStore::begin`]
//! and closed exactly once by [`HistoryStore::complete`]; nothing else writes
//! to it and nothing deletes it.

use std::sync::Mutex;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, error, info, warn};

use crate::db::{fmt_ts, lock, now, parse_opt_ts, parse_ts, SharedConnection};
use crate::error::{Result, SchedulerError};
use crate::types::{
    Closed, Completion, ExecutionRecord, ExecutionStatus, FireInstanceId, HistoryFilter, NewExecution,
    RecordId,
};

const RECORD_COLUMNS: &str = "id, job_name, job_group, job_type, job_data, fire_instance_id,
     status, started_at, completed_at, duration_ms, error_message, stack_trace,
     retry_count, max_retries, next_retry_at, result_data, created_at, updated_at";

/// Default page size for [`HistoryStore::recent`].
pub const DEFAULT_RECENT_COUNT: u32 = 50;

pub struct HistoryStore {
    conn: SharedConnection,
    /// Completions the store refused, replayed by [`HistoryStore::flush_deferred`].
    deferred: Mutex<Vec<(RecordId, ExecutionStatus, Completion)>>,
}

impl HistoryStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self {
            conn,
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Open a `Running` record for a physical attempt that is starting now.
    pub fn begin(&self, new: &NewExecution) -> Result<RecordId> {
        let conn = lock(&self.conn)?;
        let id = RecordId::new();
        let now = fmt_ts(now());

        conn.execute(
            "INSERT INTO job_execution_history
             (id, job_name, job_group, job_type, job_data, fire_instance_id, status,
              started_at, retry_count, max_retries, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running', ?7, ?8, ?9, ?7, ?7)",
            params![
                id.as_str(),
                new.key.name,
                new.key.group,
                new.job_type,
                new.job_data,
                new.fire_instance_id.as_str(),
                now,
                new.retry_count,
                new.max_retries,
            ],
        )?;
        debug!(record_id = %id, fire_instance_id = %new.fire_instance_id, "history record opened");
        Ok(id)
    }

    /// Close a `Running` record with a terminal status.
    ///
    /// Returns `Ok(None)` without touching the row when it is already
    /// closed, so a repeated call never alters `status` or `duration_ms`.
    pub fn complete(
        &self,
        id: &RecordId,
        status: ExecutionStatus,
        completion: Completion,
    ) -> Result<Option<Closed>> {
        if !status.is_terminal() {
            return Err(SchedulerError::InvalidTransition(format!(
                "record {id} cannot be completed as {status}"
            )));
        }

        let conn = lock(&self.conn)?;
        let current: Option<(String, String, u32, u32)> = conn
            .query_row(
                "SELECT status, started_at, retry_count, max_retries
                 FROM job_execution_history WHERE id = ?1",
                [id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((current_status, started_at, retry_count, max_retries)) = current else {
            return Err(SchedulerError::RecordNotFound { id: id.to_string() });
        };

        if current_status != ExecutionStatus::Running.as_str() {
            warn!(record_id = %id, %current_status, requested = %status, "record already closed; ignoring");
            return Ok(None);
        }

        let started_at = parse_ts(&started_at)?;
        // A clock step backwards must not produce a negative duration.
        let completed_at = completion
            .completed_at
            .map_or_else(now, |at| at.trunc_subsecs(3))
            .max(started_at);
        let duration_ms = (completed_at - started_at).num_milliseconds();

        let next_retry_at = match status {
            ExecutionStatus::FailedWillRetry => {
                if retry_count >= max_retries {
                    return Err(SchedulerError::InvalidTransition(format!(
                        "record {id} has exhausted its retry budget ({retry_count}/{max_retries})"
                    )));
                }
                match completion.next_retry_at.map(|at| at.trunc_subsecs(3)) {
                    Some(at) if at > completed_at => Some(at),
                    Some(_) => Some(completed_at + chrono::Duration::milliseconds(1)),
                    None => {
                        return Err(SchedulerError::InvalidTransition(format!(
                            "record {id} marked for retry without a retry time"
                        )))
                    }
                }
            }
            _ => None,
        };

        let completed = fmt_ts(completed_at);
        let changed = conn.execute(
            "UPDATE job_execution_history
             SET status = ?1, completed_at = ?2, duration_ms = ?3, error_message = ?4,
                 stack_trace = ?5, result_data = ?6, next_retry_at = ?7, updated_at = ?2
             WHERE id = ?8 AND status = 'running'",
            params![
                status.as_str(),
                completed,
                duration_ms,
                completion.error_message,
                completion.stack_trace,
                completion.result_data,
                next_retry_at.map(fmt_ts),
                id.as_str(),
            ],
        )?;

        // Another connection closed it between our read and write.
        if changed == 0 {
            warn!(record_id = %id, "record closed concurrently; ignoring");
            return Ok(None);
        }
        debug!(record_id = %id, %status, duration_ms, "history record closed");
        Ok(Some(Closed {
            completed_at,
            next_retry_at,
        }))
    }

    /// Keep a completion the store could not take so a later
    /// [`HistoryStore::flush_deferred`] can write it.
    pub fn defer_completion(&self, id: RecordId, status: ExecutionStatus, completion: Completion) {
        if let Ok(mut deferred) = self.deferred.lock() {
            deferred.push((id, status, completion));
        }
    }

    /// Completions still waiting for the store.
    pub fn deferred_completions(&self) -> usize {
        self.deferred.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Retry every deferred completion. Returns how many were written.
    /// Completions the store rejects outright are dropped with an error log.
    pub fn flush_deferred(&self) -> usize {
        let pending = match self.deferred.lock() {
            Ok(mut deferred) if !deferred.is_empty() => std::mem::take(&mut *deferred),
            _ => return 0,
        };
        let mut written = 0;
        let mut failed = Vec::new();
        for (id, status, completion) in pending {
            match self.complete(&id, status, completion.clone()) {
                Ok(_) => {
                    info!(record_id = %id, %status, "deferred history completion written");
                    written += 1;
                }
                Err(e @ SchedulerError::InvalidTransition(_))
                | Err(e @ SchedulerError::RecordNotFound { .. }) => {
                    error!(record_id = %id, %status, error = %e, "deferred completion rejected");
                }
                Err(e) => {
                    debug!(record_id = %id, error = %e, "deferred completion still failing");
                    failed.push((id, status, completion));
                }
            }
        }
        if !failed.is_empty() {
            if let Ok(mut deferred) = self.deferred.lock() {
                failed.append(&mut deferred);
                *deferred = failed;
            }
        }
        written
    }

    pub fn get(&self, id: &RecordId) -> Result<Option<ExecutionRecord>> {
        self.fetch_one("id = ?1", id.as_str())
    }

    pub fn get_by_fire_instance(
        &self,
        fire_instance_id: &FireInstanceId,
    ) -> Result<Option<ExecutionRecord>> {
        self.fetch_one("fire_instance_id = ?1", fire_instance_id.as_str())
    }

    /// Most recent attempts of one job, newest first.
    pub fn recent(&self, job_name: &str, count: u32) -> Result<Vec<ExecutionRecord>> {
        self.query(&HistoryFilter {
            job_name: Some(job_name.to_string()),
            limit: Some(count),
            ..HistoryFilter::default()
        })
    }

    /// `FailedWillRetry` records whose retry time has passed, oldest first.
    pub fn due_for_retry(&self, at: DateTime<Utc>) -> Result<Vec<ExecutionRecord>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM job_execution_history
             WHERE status = 'failed_will_retry' AND next_retry_at IS NOT NULL
               AND next_retry_at <= ?1
             ORDER BY next_retry_at"
        ))?;
        let rows = stmt
            .query_map([fmt_ts(at)], RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawRecord::into_record).collect()
    }

    /// Filtered lookup, newest first. Read-only; never blocks execution
    /// beyond the store's own locking.
    pub fn query(&self, filter: &HistoryFilter) -> Result<Vec<ExecutionRecord>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(ref name) = filter.job_name {
            args.push(name.clone());
            clauses.push("job_name = ?");
        }
        if let Some(ref group) = filter.job_group {
            args.push(group.clone());
            clauses.push("job_group = ?");
        }
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            clauses.push("status = ?");
        }
        if let Some(after) = filter.started_after {
            args.push(fmt_ts(after));
            clauses.push("started_at >= ?");
        }
        if let Some(before) = filter.started_before {
            args.push(fmt_ts(before));
            clauses.push("started_at < ?");
        }

        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM job_execution_history");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY started_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawRecord::into_record).collect()
    }

    fn fetch_one(&self, predicate: &str, arg: &str) -> Result<Option<ExecutionRecord>> {
        let conn = lock(&self.conn)?;
        let raw = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM job_execution_history WHERE {predicate}"),
                [arg],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }
}

/// Row as stored, before timestamps and status are decoded.
struct RawRecord {
    id: String,
    job_name: String,
    job_group: String,
    job_type: String,
    job_data: Option<String>,
    fire_instance_id: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    stack_trace: Option<String>,
    retry_count: u32,
    max_retries: u32,
    next_retry_at: Option<String>,
    result_data: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_name: row.get(1)?,
            job_group: row.get(2)?,
            job_type: row.get(3)?,
            job_data: row.get(4)?,
            fire_instance_id: row.get(5)?,
            status: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            duration_ms: row.get(9)?,
            error_message: row.get(10)?,
            stack_trace: row.get(11)?,
            retry_count: row.get(12)?,
            max_retries: row.get(13)?,
            next_retry_at: row.get(14)?,
            result_data: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord> {
        let status = self
            .status
            .parse::<ExecutionStatus>()
            .map_err(SchedulerError::CorruptRow)?;
        Ok(ExecutionRecord {
            id: RecordId(self.id),
            job_name: self.job_name,
            job_group: self.job_group,
            job_type: self.job_type,
            job_data: self.job_data,
            fire_instance_id: FireInstanceId(self.fire_instance_id),
            status,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            duration_ms: self.duration_ms,
            error_message: self.error_message,
            stack_trace: self.stack_trace,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            next_retry_at: parse_opt_ts(self.next_retry_at)?,
            result_data: self.result_data,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::Database;
    use crate::types::JobKey;

    fn store() -> HistoryStore {
        let db = Database::in_memory().unwrap();
        HistoryStore::new(db.connect().unwrap())
    }

    fn execution(name: &str, retry_count: u32) -> NewExecution {
        NewExecution {
            key: JobKey::new(name, "Email"),
            job_type: "email.send_verification".to_string(),
            job_data: Some(r#"{"email":"a@b.com"}"#.to_string()),
            fire_instance_id: FireInstanceId::new(),
            retry_count,
            max_retries: 3,
        }
    }

    #[test]
    fn begin_opens_running_record() {
        let store = store();
        let id = store.begin(&execution("verify", 0)).unwrap();
        let rec = store.get(&id).unwrap().unwrap();

        assert_eq!(rec.status, ExecutionStatus::Running);
        assert!(rec.completed_at.is_none());
        assert!(rec.duration_ms.is_none());
        assert_eq!(rec.retry_count, 0);
        assert_eq!(rec.job_data.as_deref(), Some(r#"{"email":"a@b.com"}"#));
    }

    #[test]
    fn complete_sets_duration_from_timestamps() {
        let store = store();
        let id = store.begin(&execution("verify", 0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let closed = store
            .complete(&id, ExecutionStatus::Success, Completion::default())
            .unwrap()
            .unwrap();

        let rec = store.get(&id).unwrap().unwrap();
        let completed_at = rec.completed_at.unwrap();
        assert_eq!(completed_at, closed.completed_at);
        assert_eq!(rec.status, ExecutionStatus::Success);
        assert_eq!(
            rec.duration_ms,
            Some((completed_at - rec.started_at).num_milliseconds())
        );
        assert!(rec.duration_ms.unwrap() >= 0);
    }

    #[test]
    fn second_complete_is_a_no_op() {
        let store = store();
        let id = store.begin(&execution("verify", 0)).unwrap();
        store
            .complete(&id, ExecutionStatus::Success, Completion::default())
            .unwrap();
        let first = store.get(&id).unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let changed = store
            .complete(
                &id,
                ExecutionStatus::Failed,
                Completion {
                    error_message: Some("late".into()),
                    ..Completion::default()
                },
            )
            .unwrap();
        let second = store.get(&id).unwrap().unwrap();

        assert!(changed.is_none());
        assert_eq!(second.status, ExecutionStatus::Success);
        assert_eq!(second.duration_ms, first.duration_ms);
        assert_eq!(second.completed_at, first.completed_at);
        assert!(second.error_message.is_none());
    }

    #[test]
    fn retry_requires_budget_and_time() {
        let store = store();
        let exhausted = store.begin(&execution("verify", 3)).unwrap();
        let err = store
            .complete(
                &exhausted,
                ExecutionStatus::FailedWillRetry,
                Completion {
                    next_retry_at: Some(Utc::now() + chrono::Duration::minutes(1)),
                    ..Completion::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition(_)));

        let fresh = store.begin(&execution("verify", 0)).unwrap();
        let err = store
            .complete(&fresh, ExecutionStatus::FailedWillRetry, Completion::default())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition(_)));
        // Rejected calls leave the record open.
        assert_eq!(
            store.get(&fresh).unwrap().unwrap().status,
            ExecutionStatus::Running
        );
    }

    #[test]
    fn retry_time_is_strictly_after_completion() {
        let store = store();
        let id = store.begin(&execution("verify", 0)).unwrap();
        let closed = store
            .complete(
                &id,
                ExecutionStatus::FailedWillRetry,
                Completion {
                    error_message: Some("smtp down".into()),
                    next_retry_at: Some(Utc::now() - chrono::Duration::seconds(5)),
                    ..Completion::default()
                },
            )
            .unwrap()
            .unwrap();
        let rec = store.get(&id).unwrap().unwrap();
        assert!(rec.next_retry_at.unwrap() > rec.completed_at.unwrap());
        assert_eq!(closed.next_retry_at, rec.next_retry_at);
    }

    #[test]
    fn explicit_completion_time_sets_duration() {
        let store = store();
        let id = store.begin(&execution("verify", 0)).unwrap();
        let started_at = store.get(&id).unwrap().unwrap().started_at;
        let finished = started_at + chrono::Duration::milliseconds(250);
        store
            .complete(
                &id,
                ExecutionStatus::Success,
                Completion {
                    completed_at: Some(finished),
                    ..Completion::default()
                },
            )
            .unwrap();

        let rec = store.get(&id).unwrap().unwrap();
        assert_eq!(rec.completed_at, Some(finished));
        assert_eq!(rec.duration_ms, Some(250));
    }

    #[test]
    fn deferred_completion_is_written_once_the_table_is_back() {
        let conn = Database::in_memory().unwrap().connect().unwrap();
        let store = HistoryStore::new(Arc::clone(&conn));
        let id = store.begin(&execution("verify", 0)).unwrap();

        conn.lock()
            .unwrap()
            .execute_batch("ALTER TABLE job_execution_history RENAME TO history_offline")
            .unwrap();
        assert!(store
            .complete(&id, ExecutionStatus::Success, Completion::default())
            .is_err());
        store.defer_completion(id.clone(), ExecutionStatus::Success, Completion::default());
        assert_eq!(store.flush_deferred(), 0);
        assert_eq!(store.deferred_completions(), 1);

        conn.lock()
            .unwrap()
            .execute_batch("ALTER TABLE history_offline RENAME TO job_execution_history")
            .unwrap();
        assert_eq!(store.flush_deferred(), 1);
        assert_eq!(store.deferred_completions(), 0);
        assert_eq!(
            store.get(&id).unwrap().unwrap().status,
            ExecutionStatus::Success
        );
    }

    #[test]
    fn rejected_deferred_completion_is_dropped() {
        let store = store();
        store.defer_completion(
            RecordId::from("missing"),
            ExecutionStatus::Failed,
            Completion::default(),
        );
        assert_eq!(store.flush_deferred(), 0);
        assert_eq!(store.deferred_completions(), 0);
    }

    #[test]
    fn running_is_not_a_completion_status() {
        let store = store();
        let id = store.begin(&execution("verify", 0)).unwrap();
        assert!(store
            .complete(&id, ExecutionStatus::Running, Completion::default())
            .is_err());
    }

    #[test]
    fn unknown_record_is_reported() {
        let store = store();
        let err = store
            .complete(
                &RecordId::from("missing"),
                ExecutionStatus::Success,
                Completion::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::RecordNotFound { .. }));
    }

    #[test]
    fn fire_instance_ids_are_unique() {
        let store = store();
        let new = execution("verify", 0);
        store.begin(&new).unwrap();
        assert!(store.begin(&new).is_err());
    }

    #[test]
    fn query_filters_by_name_and_status() {
        let store = store();
        let ok = store.begin(&execution("verify", 0)).unwrap();
        store
            .complete(&ok, ExecutionStatus::Success, Completion::default())
            .unwrap();
        let bad = store.begin(&execution("verify", 0)).unwrap();
        store
            .complete(&bad, ExecutionStatus::Failed, Completion::default())
            .unwrap();
        store.begin(&execution("digest", 0)).unwrap();

        let failed = store
            .query(&HistoryFilter {
                job_name: Some("verify".into()),
                status: Some(ExecutionStatus::Failed),
                ..HistoryFilter::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, bad);

        assert_eq!(store.recent("verify", DEFAULT_RECENT_COUNT).unwrap().len(), 2);
        assert_eq!(store.recent("verify", 1).unwrap().len(), 1);
        assert_eq!(store.query(&HistoryFilter::default()).unwrap().len(), 3);

        let future = store
            .query(&HistoryFilter {
                started_after: Some(Utc::now() + chrono::Duration::hours(1)),
                ..HistoryFilter::default()
            })
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn due_for_retry_only_returns_elapsed_retries() {
        let store = store();
        let id = store.begin(&execution("verify", 0)).unwrap();
        let retry_at = Utc::now() + chrono::Duration::minutes(1);
        store
            .complete(
                &id,
                ExecutionStatus::FailedWillRetry,
                Completion {
                    next_retry_at: Some(retry_at),
                    ..Completion::default()
                },
            )
            .unwrap();

        assert!(store.due_for_retry(Utc::now()).unwrap().is_empty());
        let due = store
            .due_for_retry(retry_at + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
    }
}
