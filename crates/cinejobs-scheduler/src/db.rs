use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use cinejobs_core::config::StorageMode;
use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, SchedulerError};

/// How long a writer waits for another node's write transaction.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type SharedConnection = Arc<Mutex<Connection>>;

/// Initialise the scheduler schema in `conn`.
///
/// Every statement is idempotent so all nodes run this on startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_execution_history (
            id                TEXT    NOT NULL PRIMARY KEY,
            job_name          TEXT    NOT NULL,
            job_group         TEXT    NOT NULL,
            job_type          TEXT    NOT NULL,
            job_data          TEXT,               -- serialized parameters
            fire_instance_id  TEXT    NOT NULL UNIQUE,
            status            TEXT    NOT NULL,
            started_at        TEXT    NOT NULL,
            completed_at      TEXT,               -- NULL while running
            duration_ms       INTEGER,
            error_message     TEXT,
            stack_trace       TEXT,
            retry_count       INTEGER NOT NULL DEFAULT 0,
            max_retries       INTEGER NOT NULL DEFAULT 3,
            next_retry_at     TEXT,
            result_data       TEXT,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_history_job
            ON job_execution_history (job_name, job_group, started_at);
        CREATE INDEX IF NOT EXISTS idx_history_status
            ON job_execution_history (status, next_retry_at);

        CREATE TABLE IF NOT EXISTS job_definitions (
            scheduler_name      TEXT    NOT NULL,
            job_name            TEXT    NOT NULL,
            job_group           TEXT    NOT NULL,
            job_type            TEXT    NOT NULL,
            max_retries         INTEGER NOT NULL,
            disallow_concurrent INTEGER NOT NULL,
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL,
            PRIMARY KEY (scheduler_name, job_name, job_group)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_triggers (
            id                TEXT    NOT NULL PRIMARY KEY,
            scheduler_name    TEXT    NOT NULL,
            job_name          TEXT    NOT NULL,
            job_group         TEXT    NOT NULL,
            job_type          TEXT    NOT NULL,
            job_data          TEXT    NOT NULL,
            retry_count       INTEGER NOT NULL DEFAULT 0,
            max_retries       INTEGER NOT NULL,
            next_fire_at      TEXT,
            previous_fire_at  TEXT,
            state             TEXT    NOT NULL DEFAULT 'waiting',
            claimed_by        TEXT,
            claimed_at        TEXT,
            fire_instance_id  TEXT,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL
        ) STRICT;

        -- Polling: SELECT … WHERE state = 'waiting' AND next_fire_at <= ? ORDER BY next_fire_at
        CREATE INDEX IF NOT EXISTS idx_triggers_due
            ON job_triggers (scheduler_name, state, next_fire_at);

        -- At most one row per identity: the row *is* the lease.
        CREATE TABLE IF NOT EXISTS job_leases (
            scheduler_name    TEXT    NOT NULL,
            job_name          TEXT    NOT NULL,
            job_group         TEXT    NOT NULL,
            lease_id          TEXT    NOT NULL,
            node_id           TEXT    NOT NULL,
            fire_instance_id  TEXT    NOT NULL,
            acquired_at       TEXT    NOT NULL,
            PRIMARY KEY (scheduler_name, job_name, job_group)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS scheduler_nodes (
            scheduler_name    TEXT    NOT NULL,
            node_id           TEXT    NOT NULL,
            started_at        TEXT    NOT NULL,
            last_checkin_at   TEXT    NOT NULL,
            PRIMARY KEY (scheduler_name, node_id)
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Handle on the store every scheduler component reads and writes.
///
/// Persistent mode hands out one connection per component (they may be
/// used from different tasks); memory mode shares a single connection
/// because each in-memory connection is its own database.
#[derive(Clone)]
pub enum Database {
    Persistent { path: PathBuf },
    Memory { conn: SharedConnection },
}

impl Database {
    /// Open the store and run migrations.
    ///
    /// Any failure here is reported as [`SchedulerError::StoreUnavailable`]:
    /// a node that cannot reach its store must not start.
    pub fn open(mode: StorageMode, path: impl AsRef<Path>) -> Result<Self> {
        let db = match mode {
            StorageMode::Persistent => Database::Persistent {
                path: path.as_ref().to_path_buf(),
            },
            StorageMode::Memory => {
                let conn = Connection::open_in_memory().map_err(unavailable)?;
                Database::Memory {
                    conn: Arc::new(Mutex::new(conn)),
                }
            }
        };

        let setup = db.connect().map_err(unavailable)?;
        {
            let conn = lock(&setup)?;
            init_db(&conn).map_err(unavailable)?;
        }
        match &db {
            Database::Persistent { path } => {
                info!(path = %path.display(), "job store opened (persistent)")
            }
            Database::Memory { .. } => info!("job store opened (in-memory, single node)"),
        }
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(StorageMode::Memory, "")
    }

    /// Connection for one component.
    pub fn connect(&self) -> Result<SharedConnection> {
        match self {
            Database::Persistent { path } => {
                let conn = Connection::open(path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
                Ok(Arc::new(Mutex::new(conn)))
            }
            Database::Memory { conn } => Ok(Arc::clone(conn)),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Database::Persistent { .. })
    }
}

fn unavailable(e: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::StoreUnavailable(e.to_string())
}

pub(crate) fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| SchedulerError::LockPoisoned)
}

/// Current time at the precision we store (milliseconds).
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Fixed-width RFC 3339 so that string order equals time order in SQL.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::CorruptRow(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}
