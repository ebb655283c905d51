// A store outage between a payload finishing and its trigger bookkeeping.
// The trigger table is renamed away from a second connection while the
// payload runs, then restored; the node must replay what it could not write.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cinejobs_core::config::StorageMode;
use cinejobs_scheduler::{
    Database, ExecutionStatus, FireInstanceId, HistoryFilter, Job, JobContext, JobDefinition,
    JobError, JobKey, JobParams, JobRegistry, LeaseAttempt, RetryPolicy, Scheduler,
    SchedulerSettings, TriggerFilter, TriggerState,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::Notify;

#[derive(Serialize, Deserialize)]
struct Step {
    n: u32,
}

impl JobParams for Step {}

/// Signals that it started, then waits to be released.
struct Gated {
    started: Arc<Notify>,
    release: Arc<Notify>,
    fail: bool,
}

#[async_trait]
impl Job for Gated {
    type Params = Step;
    const JOB_TYPE: &'static str = "test.gated";

    async fn execute(&self, _params: Step, _ctx: &JobContext) -> Result<Option<serde_json::Value>, JobError> {
        self.started.notify_one();
        self.release.notified().await;
        if self.fail {
            return Err(JobError::transient("smtp timeout"));
        }
        Ok(None)
    }
}

struct Harness {
    scheduler: Scheduler,
    path: std::path::PathBuf,
    started: Arc<Notify>,
    release: Arc<Notify>,
    _dir: TempDir,
}

fn key() -> JobKey {
    JobKey::new("gated", "Outage")
}

fn harness(fail: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");
    let db = Database::open(StorageMode::Persistent, &path).unwrap();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let mut registry = JobRegistry::new();
    registry.register(Gated {
        started: started.clone(),
        release: release.clone(),
        fail,
    });
    let settings = SchedulerSettings {
        node_id: "node-outage".into(),
        ..SchedulerSettings::default()
    };
    let scheduler = Scheduler::connect(&db, settings, registry, RetryPolicy::default()).unwrap();
    scheduler
        .register_durable_job(
            &JobDefinition::of::<Gated>(key())
                .max_retries(3)
                .disallow_concurrent(),
        )
        .unwrap();
    Harness {
        scheduler,
        path,
        started,
        release,
        _dir: dir,
    }
}

fn rename_table(path: &Path, from: &str, to: &str) {
    let conn = Connection::open(path).unwrap();
    conn.busy_timeout(Duration::from_secs(5)).unwrap();
    conn.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}"))
        .unwrap();
}

/// Run one attempt with `job_triggers` unavailable from the moment the
/// payload starts until it has finished.
async fn run_through_outage(h: &Harness) {
    let s = &h.scheduler;
    assert_eq!(s.tick().unwrap(), 1);
    tokio::time::timeout(Duration::from_secs(5), h.started.notified())
        .await
        .unwrap();

    rename_table(&h.path, "job_triggers", "job_triggers_offline");
    h.release.notify_one();
    s.wait_idle().await;

    assert!(s.pending_writes() > 0);
    // Still offline: the buffered writes survive a failing poll.
    assert!(s.tick().is_err());
    assert!(s.pending_writes() > 0);

    rename_table(&h.path, "job_triggers_offline", "job_triggers");
}

#[tokio::test]
async fn completion_is_replayed_after_trigger_table_outage() {
    let h = harness(false);
    let s = &h.scheduler;
    let trigger_id = s.schedule_now::<Gated>(&key(), &Step { n: 1 }).unwrap();

    run_through_outage(&h).await;
    s.tick().unwrap();

    assert_eq!(s.pending_writes(), 0);
    assert_eq!(
        s.trigger_info(&trigger_id).unwrap().unwrap().state,
        TriggerState::Complete
    );
    let records = s.history().query(&HistoryFilter::default()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Success);
    // The lease went back too.
    assert!(matches!(
        s.acquire_for_execution(&key(), &FireInstanceId::new()).unwrap(),
        LeaseAttempt::Granted(_)
    ));
}

#[tokio::test]
async fn retry_is_rescheduled_after_trigger_table_outage() {
    let h = harness(true);
    let s = &h.scheduler;
    let trigger_id = s.schedule_now::<Gated>(&key(), &Step { n: 2 }).unwrap();

    run_through_outage(&h).await;
    s.tick().unwrap();

    assert_eq!(s.pending_writes(), 0);
    assert_eq!(
        s.trigger_info(&trigger_id).unwrap().unwrap().state,
        TriggerState::Complete
    );

    let records = s.history().query(&HistoryFilter::default()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::FailedWillRetry);

    let waiting = s
        .list_triggers(&TriggerFilter {
            state: Some(TriggerState::Waiting),
            ..TriggerFilter::default()
        })
        .unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].retry_count, 1);
    // The retry fires exactly when the history says it will.
    assert_eq!(waiting[0].next_fire_time, records[0].next_retry_at);
}
