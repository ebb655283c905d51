// Retry and cancellation behaviour of a single node, end to end through
// the trigger store and execution history.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cinejobs_scheduler::{
    Database, ExecutionStatus, HistoryFilter, Job, JobContext, JobDefinition, JobError, JobKey,
    JobParams, JobRegistry, RetryPolicy, Scheduler, SchedulerSettings, TriggerFilter,
    TriggerState,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Work {
    id: u32,
}

impl JobParams for Work {}

/// Fails on every attempt.
struct Flaky(Arc<AtomicU32>);

#[async_trait]
impl Job for Flaky {
    type Params = Work;
    const JOB_TYPE: &'static str = "test.flaky";

    async fn execute(&self, _params: Work, _ctx: &JobContext) -> Result<Option<serde_json::Value>, JobError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(JobError::transient("connection refused"))
    }
}

/// Runs until cancelled.
struct Patient;

#[async_trait]
impl Job for Patient {
    type Params = Work;
    const JOB_TYPE: &'static str = "test.patient";

    async fn execute(&self, _params: Work, ctx: &JobContext) -> Result<Option<serde_json::Value>, JobError> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(JobError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(None),
        }
    }
}

fn node(registry: JobRegistry) -> Scheduler {
    let db = Database::in_memory().unwrap();
    let settings = SchedulerSettings {
        node_id: "node-test".into(),
        shutdown_grace: Duration::from_secs(2),
        ..SchedulerSettings::default()
    };
    // Millisecond backoff keeps the whole retry chain inside one test.
    let retry = RetryPolicy::new(chrono::Duration::milliseconds(5), 2, chrono::Duration::milliseconds(50));
    Scheduler::connect(&db, settings, registry, retry).unwrap()
}

#[tokio::test]
async fn failing_job_is_retried_until_budget_is_spent() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = JobRegistry::new();
    registry.register(Flaky(attempts.clone()));
    let s = node(registry);
    let key = JobKey::new("flaky", "Test");
    s.register_durable_job(&JobDefinition::of::<Flaky>(key.clone()).max_retries(3))
        .unwrap();
    s.schedule_now::<Flaky>(&key, &Work { id: 1 }).unwrap();

    for _ in 0..200 {
        s.tick().unwrap();
        s.wait_idle().await;
        if attempts.load(Ordering::SeqCst) >= 4 && s.pending_writes() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Nothing further is ever scheduled.
    tokio::time::sleep(Duration::from_millis(100)).await;
    s.tick().unwrap();
    s.wait_idle().await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    let mut records = s
        .history()
        .query(&HistoryFilter {
            job_name: Some("flaky".into()),
            ..Default::default()
        })
        .unwrap();
    records.sort_by_key(|r| r.retry_count);
    assert_eq!(records.len(), 4);
    assert_eq!(
        records.iter().map(|r| r.retry_count).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    for r in &records[..3] {
        assert_eq!(r.status, ExecutionStatus::FailedWillRetry);
        assert!(r.next_retry_at.unwrap() > r.completed_at.unwrap());
        assert_eq!(r.max_retries, 3);
    }
    assert!(records[0].next_retry_at < records[1].next_retry_at);
    assert!(records[1].next_retry_at < records[2].next_retry_at);
    assert_eq!(records[3].status, ExecutionStatus::Failed);
    assert!(records[3].next_retry_at.is_none());
    assert_eq!(records[3].error_message.as_deref(), Some("connection refused"));

    // Every physical attempt got its own fire instance.
    let fire_ids: HashSet<_> = records.iter().map(|r| r.fire_instance_id.clone()).collect();
    assert_eq!(fire_ids.len(), 4);

    let live = s
        .list_triggers(&TriggerFilter {
            state: Some(TriggerState::Waiting),
            ..Default::default()
        })
        .unwrap();
    assert!(live.is_empty());
}

#[tokio::test]
async fn cancelled_execution_is_never_rescheduled() {
    let mut registry = JobRegistry::new();
    registry.register(Patient);
    let s = node(registry);
    let key = JobKey::new("patient", "Test");
    s.register_durable_job(&JobDefinition::of::<Patient>(key.clone()).max_retries(3))
        .unwrap();
    let trigger_id = s.schedule_now::<Patient>(&key, &Work { id: 2 }).unwrap();

    assert_eq!(s.tick().unwrap(), 1);
    let running = s.running_executions();
    assert_eq!(running.len(), 1);
    // Let the payload start before cancelling it.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(s.cancel_execution(&running[0]));
    s.wait_idle().await;

    let record = s
        .history()
        .get_by_fire_instance(&running[0])
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert!(record.next_retry_at.is_none());

    let triggers = s.list_triggers(&TriggerFilter::default()).unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].trigger_id, trigger_id);
    assert_eq!(triggers[0].state, TriggerState::Complete);
    assert!(!s.cancel_execution(&running[0]));
}

#[tokio::test]
async fn shutdown_cancels_running_payloads() {
    let mut registry = JobRegistry::new();
    registry.register(Patient);
    let s = node(registry);
    let key = JobKey::new("patient", "Test");
    s.register_durable_job(&JobDefinition::of::<Patient>(key.clone())).unwrap();
    s.schedule_now::<Patient>(&key, &Work { id: 3 }).unwrap();

    s.tick().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    s.stop().await;

    let records = s.history().query(&HistoryFilter::default()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Cancelled);
    assert_eq!(s.tick().unwrap(), 0);
}
