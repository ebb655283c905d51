// Several nodes sharing one SQLite file. Every node gets its own
// connections, exactly as separate processes would.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cinejobs_core::config::StorageMode;
use cinejobs_scheduler::store::NewTrigger;
use cinejobs_scheduler::{
    Database, ExecutionStatus, FireInstanceId, HistoryFilter, Job, JobContext, JobDefinition,
    JobError, JobKey, JobParams, JobRegistry, LeaseAttempt, RetryPolicy, Scheduler,
    SchedulerSettings, TriggerFilter, TriggerState, TriggerStore,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Serialize, Deserialize)]
struct Ping {
    n: u32,
}

impl JobParams for Ping {}

struct CountingJob(Arc<AtomicU32>);

#[async_trait]
impl Job for CountingJob {
    type Params = Ping;
    const JOB_TYPE: &'static str = "test.ping";

    async fn execute(&self, _params: Ping, _ctx: &JobContext) -> Result<Option<serde_json::Value>, JobError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

fn key() -> JobKey {
    JobKey::new("ping", "Cluster")
}

fn shared_db(dir: &TempDir) -> Database {
    Database::open(StorageMode::Persistent, dir.path().join("jobs.db")).unwrap()
}

fn node(db: &Database, node_id: &str, runs: Arc<AtomicU32>, settings: SchedulerSettings) -> Scheduler {
    let mut registry = JobRegistry::new();
    registry.register(CountingJob(runs));
    let settings = SchedulerSettings {
        instance_name: "cluster-test".into(),
        node_id: node_id.into(),
        ..settings
    };
    let scheduler = Scheduler::connect(db, settings, registry, RetryPolicy::default()).unwrap();
    scheduler
        .register_durable_job(&JobDefinition::of::<CountingJob>(key()).disallow_concurrent())
        .unwrap();
    scheduler
}

#[test]
fn racing_lease_acquisition_has_exactly_one_winner() {
    const RACERS: usize = 8;
    let dir = TempDir::new().unwrap();
    let db = shared_db(&dir);
    let barrier = Arc::new(Barrier::new(RACERS));

    let handles: Vec<_> = (0..RACERS)
        .map(|i| {
            // Separate connection per racer.
            let conn = db.connect().unwrap();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let store = TriggerStore::new(conn, "cluster-test");
                barrier.wait();
                store
                    .acquire_lease(
                        &key(),
                        &format!("node-{i}"),
                        &FireInstanceId::new(),
                        Utc::now() - chrono::Duration::seconds(70),
                    )
                    .unwrap()
            })
        })
        .collect();

    let results: Vec<LeaseAttempt> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let granted = results
        .iter()
        .filter(|r| matches!(r, LeaseAttempt::Granted(_)))
        .count();
    assert_eq!(granted, 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, LeaseAttempt::Busy { .. }))
            .count(),
        RACERS - 1
    );
}

#[tokio::test]
async fn two_nodes_fire_a_trigger_once() {
    let dir = TempDir::new().unwrap();
    let db = shared_db(&dir);
    let runs = Arc::new(AtomicU32::new(0));
    let a = node(&db, "node-a", runs.clone(), SchedulerSettings::default());
    let b = node(&db, "node-b", runs.clone(), SchedulerSettings::default());

    a.schedule_now::<CountingJob>(&key(), &Ping { n: 1 }).unwrap();

    let fired = a.tick().unwrap() + b.tick().unwrap();
    assert_eq!(fired, 1);
    a.wait_idle().await;
    b.wait_idle().await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Both nodes see the same history.
    let from_b = b.history().query(&HistoryFilter::default()).unwrap();
    assert_eq!(from_b.len(), 1);
    assert_eq!(from_b[0].status, ExecutionStatus::Success);
}

#[tokio::test]
async fn lease_held_by_live_peer_blocks_until_released() {
    let dir = TempDir::new().unwrap();
    let db = shared_db(&dir);
    let runs = Arc::new(AtomicU32::new(0));
    let a = node(&db, "node-a", runs.clone(), SchedulerSettings::default());
    let b = node(&db, "node-b", runs.clone(), SchedulerSettings::default());

    let LeaseAttempt::Granted(lease) = a.acquire_for_execution(&key(), &FireInstanceId::new()).unwrap() else {
        panic!("lease should be free");
    };
    let id = b.schedule_now::<CountingJob>(&key(), &Ping { n: 2 }).unwrap();
    assert_eq!(b.tick().unwrap(), 0);
    assert_eq!(b.trigger_info(&id).unwrap().unwrap().state, TriggerState::Blocked);

    a.release_lease(&lease).unwrap();
    assert_eq!(b.tick().unwrap(), 1);
    b.wait_idle().await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn overdue_trigger_is_fired_by_misfire_recovery() {
    let dir = TempDir::new().unwrap();
    let db = shared_db(&dir);
    let runs = Arc::new(AtomicU32::new(0));
    let a = node(&db, "node-a", runs.clone(), SchedulerSettings::default());

    let id = a
        .schedule_once::<CountingJob>(&key(), &Ping { n: 3 }, Utc::now() - chrono::Duration::minutes(5))
        .unwrap();

    // Past the misfire threshold: the regular poll leaves it alone.
    assert_eq!(a.tick().unwrap(), 0);
    assert_eq!(a.check_in().unwrap(), 1);
    a.wait_idle().await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(a.trigger_info(&id).unwrap().unwrap().state, TriggerState::Complete);
    assert_eq!(a.check_in().unwrap(), 0);
}

#[tokio::test]
async fn claims_of_a_dead_node_are_recovered() {
    let dir = TempDir::new().unwrap();
    let db = shared_db(&dir);
    let runs = Arc::new(AtomicU32::new(0));

    // A node that claimed a trigger and took its lease, then went silent.
    let ghost = TriggerStore::new(db.connect().unwrap(), "cluster-test");
    ghost.check_in("ghost").unwrap();
    let trigger_id = ghost
        .insert_trigger(&NewTrigger {
            key: key(),
            job_type: CountingJob::JOB_TYPE.into(),
            job_data: r#"{"n":4}"#.into(),
            fire_at: Utc::now(),
            retry_count: 0,
            max_retries: 3,
        })
        .unwrap();
    let claimed = ghost
        .claim_due("ghost", Utc::now(), Utc::now() - chrono::Duration::minutes(1), 1)
        .unwrap();
    assert_eq!(claimed.len(), 1);
    ghost
        .acquire_lease(&key(), "ghost", &claimed[0].fire_instance_id, Utc::now())
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));

    // Zero thresholds: anything not checked in this very moment is dead.
    let b = node(
        &db,
        "node-b",
        runs.clone(),
        SchedulerSettings {
            checkin_interval: Duration::ZERO,
            misfire_threshold: Duration::ZERO,
            ..SchedulerSettings::default()
        },
    );
    assert_eq!(b.tick().unwrap(), 0);

    b.check_in().unwrap();
    b.tick().unwrap();
    b.wait_idle().await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let info = b.trigger_info(&trigger_id).unwrap().unwrap();
    assert_eq!(info.state, TriggerState::Complete);
    assert!(b
        .list_triggers(&TriggerFilter {
            state: Some(TriggerState::Waiting),
            ..Default::default()
        })
        .unwrap()
        .is_empty());
}
