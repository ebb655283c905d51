use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cinejobs_core::config::{SchedulerConfig, AUTO_INSTANCE_ID};
use cinejobs_core::CineJobsConfig;
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{self, Database};
use crate::error::{Result, SchedulerError};
use crate::history::HistoryStore;
use crate::instrument::{instrumented_execute, ExecutionOutcome};
use crate::job::{ErasedJob, Job, JobContext, JobDefinition, JobParams, JobRegistry};
use crate::retry::RetryPolicy;
use crate::store::{ClaimedTrigger, Lease, LeaseAttempt, NewTrigger, TriggerStore};
use crate::types::{FireInstanceId, JobKey, TriggerDescriptor, TriggerFilter, TriggerId};

/// Runtime settings of one scheduler node.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Cluster name. Nodes with the same name share triggers and leases.
    pub instance_name: String,
    pub node_id: String,
    pub pool_size: usize,
    pub checkin_interval: Duration,
    pub misfire_threshold: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let node_id = if config.instance_id.eq_ignore_ascii_case(AUTO_INSTANCE_ID) {
            generate_node_id()
        } else {
            config.instance_id.clone()
        };
        Self {
            instance_name: config.instance_name.clone(),
            node_id,
            pool_size: config.pool_size.max(1),
            checkin_interval: Duration::from_secs(config.checkin_interval_secs),
            misfire_threshold: Duration::from_secs(config.misfire_threshold_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }

    fn misfire_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - to_chrono(self.misfire_threshold)
    }

    /// A lease holder silent since this instant has lost its lease.
    fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - to_chrono(self.checkin_interval) - to_chrono(self.misfire_threshold)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

fn generate_node_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string());
    format!("{host}-{}", Uuid::now_v7().simple())
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Store writes that failed after a payload finished and are retried on
/// every poll until the store accepts them.
#[derive(Debug, Clone)]
enum PendingWrite {
    Reschedule(NewTrigger),
    CompleteTrigger { id: TriggerId, fired_at: DateTime<Utc> },
    ReleaseTrigger(TriggerId),
    ReleaseLease(Lease),
}

struct SchedulerInner {
    settings: SchedulerSettings,
    triggers: TriggerStore,
    history: HistoryStore,
    registry: JobRegistry,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    /// Cancellation handles of in-flight executions.
    running: DashMap<FireInstanceId, CancellationToken>,
    pending: Mutex<Vec<PendingWrite>>,
    started: AtomicBool,
    main_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Handle on one scheduler node. Cheap to clone; created once at startup
/// and passed to whatever needs to schedule work.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Open the store described by `config` and connect a node to it.
    pub fn from_config(config: &CineJobsConfig, registry: JobRegistry) -> Result<Self> {
        let db = Database::open(config.scheduler.storage, &config.database.path)?;
        Self::connect(
            &db,
            SchedulerSettings::from_config(&config.scheduler),
            registry,
            RetryPolicy::from_config(&config.retry),
        )
    }

    /// Connect a node to an opened store.
    ///
    /// Fails with [`SchedulerError::StoreUnavailable`] if the store cannot be
    /// reached; a node without its store must not accept work.
    pub fn connect(
        db: &Database,
        settings: SchedulerSettings,
        registry: JobRegistry,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let unavailable = |e: SchedulerError| SchedulerError::StoreUnavailable(e.to_string());
        let triggers = TriggerStore::new(db.connect().map_err(unavailable)?, &settings.instance_name);
        let history = HistoryStore::new(db.connect().map_err(unavailable)?);

        triggers.check_in(&settings.node_id).map_err(unavailable)?;
        triggers.recover_node(&settings.node_id).map_err(unavailable)?;

        info!(
            scheduler = %settings.instance_name,
            node_id = %settings.node_id,
            pool_size = settings.pool_size,
            clustered = db.is_shared(),
            job_types = ?registry.job_types().collect::<Vec<_>>(),
            "scheduler node connected"
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                permits: Arc::new(Semaphore::new(settings.pool_size)),
                settings,
                triggers,
                history,
                registry,
                retry,
                shutdown: CancellationToken::new(),
                running: DashMap::new(),
                pending: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                main_loop: Mutex::new(None),
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.settings.node_id
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Read-only access to execution history.
    pub fn history(&self) -> &HistoryStore {
        &self.inner.history
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.shutdown.is_cancelled()
    }

    // --- lifecycle ---------------------------------------------------------

    /// Spawn the poll/check-in loop. Calling it twice is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::NotRunning);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!(node_id = %self.node_id(), "scheduler already started");
            return Ok(());
        }
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run().await });
        *self
            .inner
            .main_loop
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned)? = Some(handle);
        info!(node_id = %self.node_id(), "scheduler started");
        Ok(())
    }

    /// Stop claiming work, signal cancellation to every running payload and
    /// wait up to the shutdown grace period for them to finish.
    pub async fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!(node_id = %self.node_id(), in_flight = self.inner.running.len(), "scheduler stopping");
        self.inner.shutdown.cancel();

        let handle = self.inner.main_loop.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("scheduler loop ended abnormally: {e}");
            }
        }

        let grace = self.inner.settings.shutdown_grace;
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            warn!(
                node_id = %self.node_id(),
                still_running = self.inner.running.len(),
                "shutdown grace period elapsed; abandoning running jobs"
            );
        }

        self.flush_pending();
        if let Err(e) = self.inner.triggers.sign_off(self.node_id()) {
            warn!(node_id = %self.node_id(), error = %e, "could not remove node check-in");
        }
        info!(node_id = %self.node_id(), "scheduler stopped");
    }

    /// Wait until no execution is running on this node.
    pub async fn wait_idle(&self) {
        let all = self.inner.settings.pool_size as u32;
        if let Ok(permits) = self.inner.permits.acquire_many(all).await {
            drop(permits);
        }
    }

    async fn run(self) {
        let settings = &self.inner.settings;
        let mut poll = tokio::time::interval(settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut checkin = tokio::time::interval(settings.checkin_interval.max(Duration::from_millis(10)));
        checkin.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                _ = checkin.tick() => {
                    if let Err(e) = self.check_in() {
                        error!(node_id = %settings.node_id, "check-in failed: {e}");
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.tick() {
                        error!(node_id = %settings.node_id, "scheduler tick error: {e}");
                    }
                }
            }
        }
        debug!(node_id = %settings.node_id, "scheduler loop exited");
    }

    // --- loop bodies -------------------------------------------------------

    /// One poll: retry deferred writes, then claim and dispatch due triggers.
    /// Returns the number of executions started.
    pub fn tick(&self) -> Result<usize> {
        self.flush_pending();
        if self.inner.shutdown.is_cancelled() {
            return Ok(0);
        }
        let free = self.inner.permits.available_permits();
        if free == 0 {
            return Ok(0);
        }
        let now = db::now();
        let claimed = self.inner.triggers.claim_due(
            self.node_id(),
            now,
            self.inner.settings.misfire_cutoff(now),
            free,
        )?;
        Ok(claimed.into_iter().map(|t| self.dispatch(t)).filter(|&d| d).count())
    }

    /// Liveness heartbeat plus peer and misfire recovery.
    pub fn check_in(&self) -> Result<usize> {
        let settings = &self.inner.settings;
        let triggers = &self.inner.triggers;
        triggers.check_in(&settings.node_id)?;

        let now = db::now();
        for peer in triggers.silent_nodes(now - to_chrono(settings.checkin_interval))? {
            if peer != settings.node_id {
                debug!(node_id = %settings.node_id, peer = %peer, "peer has missed a check-in");
            }
        }

        let recovery = triggers.recover_dead_nodes(settings.stale_cutoff(now))?;
        if !recovery.is_empty() {
            warn!(
                node_id = %settings.node_id,
                dead_nodes = ?recovery.dead_nodes,
                leases_reclaimed = recovery.leases_reclaimed,
                triggers_reset = recovery.triggers_reset,
                triggers_unblocked = recovery.triggers_unblocked,
                "recovered state of dead nodes"
            );
        }

        if self.inner.shutdown.is_cancelled() {
            return Ok(0);
        }
        let free = self.inner.permits.available_permits();
        let misfired = triggers.claim_misfired(&settings.node_id, settings.misfire_cutoff(now), free)?;
        for trigger in &misfired {
            warn!(
                node_id = %settings.node_id,
                trigger_id = %trigger.id,
                job_name = %trigger.key.name,
                job_group = %trigger.key.group,
                scheduled_fire_time = %trigger.scheduled_fire_time,
                "misfired trigger recovered; firing now"
            );
        }
        Ok(misfired.into_iter().map(|t| self.dispatch(t)).filter(|&d| d).count())
    }

    /// Start executing a claimed trigger. Returns whether a task was spawned.
    fn dispatch(&self, trigger: ClaimedTrigger) -> bool {
        let inner = &self.inner;
        let Ok(permit) = Arc::clone(&inner.permits).try_acquire_owned() else {
            self.write_or_defer(PendingWrite::ReleaseTrigger(trigger.id.clone()));
            return false;
        };

        let job = match inner.registry.resolve(&trigger.job_type) {
            Ok(job) => job,
            Err(e) => {
                error!(
                    node_id = %self.node_id(),
                    trigger_id = %trigger.id,
                    error = %e,
                    "trigger moved to error"
                );
                if let Err(e) = inner.triggers.mark_error(&trigger.id) {
                    error!(trigger_id = %trigger.id, "could not mark trigger as error: {e}");
                }
                return false;
            }
        };

        let definition = match inner.triggers.definition(&trigger.key) {
            Ok(Some(def)) => def,
            Ok(None) => {
                error!(
                    trigger_id = %trigger.id,
                    job_name = %trigger.key.name,
                    job_group = %trigger.key.group,
                    "job identity has no durable definition; trigger moved to error"
                );
                if let Err(e) = inner.triggers.mark_error(&trigger.id) {
                    error!(trigger_id = %trigger.id, "could not mark trigger as error: {e}");
                }
                return false;
            }
            Err(e) => {
                warn!(trigger_id = %trigger.id, "definition lookup failed: {e}");
                self.write_or_defer(PendingWrite::ReleaseTrigger(trigger.id.clone()));
                return false;
            }
        };

        let lease = if definition.disallow_concurrent {
            match self.acquire_for_execution(&trigger.key, &trigger.fire_instance_id) {
                Ok(LeaseAttempt::Granted(lease)) => Some(lease),
                Ok(LeaseAttempt::Busy { holder }) => {
                    info!(
                        trigger_id = %trigger.id,
                        job_name = %trigger.key.name,
                        job_group = %trigger.key.group,
                        holder = holder.as_deref().unwrap_or("unknown"),
                        "lease busy; trigger blocked"
                    );
                    if let Err(e) = inner.triggers.block_trigger(&trigger.id) {
                        warn!(trigger_id = %trigger.id, "could not block trigger: {e}");
                        self.write_or_defer(PendingWrite::ReleaseTrigger(trigger.id.clone()));
                    }
                    return false;
                }
                Err(e) => {
                    warn!(trigger_id = %trigger.id, "lease acquisition failed: {e}");
                    self.write_or_defer(PendingWrite::ReleaseTrigger(trigger.id.clone()));
                    return false;
                }
            }
        } else {
            None
        };

        debug!(
            node_id = %self.node_id(),
            trigger_id = %trigger.id,
            fire_instance_id = %trigger.fire_instance_id,
            "dispatching trigger"
        );
        let cancel = inner.shutdown.child_token();
        inner
            .running
            .insert(trigger.fire_instance_id.clone(), cancel.clone());
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(trigger, job, lease, cancel, permit).await;
        });
        true
    }

    async fn execute(
        self,
        trigger: ClaimedTrigger,
        job: Arc<dyn ErasedJob>,
        lease: Option<Lease>,
        cancel: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) {
        let inner = &self.inner;
        let ctx = JobContext {
            key: trigger.key.clone(),
            job_type: trigger.job_type.clone(),
            trigger_id: trigger.id.clone(),
            fire_instance_id: trigger.fire_instance_id.clone(),
            fired_at: trigger.claimed_at,
            scheduled_fire_time: Some(trigger.scheduled_fire_time),
            retry_count: trigger.retry_count,
            max_retries: trigger.max_retries,
            job_data: trigger.job_data.clone(),
            cancel,
        };

        let outcome = instrumented_execute(&inner.history, &inner.retry, &ctx, |ctx| async move {
            job.run(&ctx).await
        })
        .await;
        inner.running.remove(&trigger.fire_instance_id);

        match outcome {
            ExecutionOutcome::Deferred { .. } => {
                self.write_or_defer(PendingWrite::ReleaseTrigger(trigger.id.clone()));
            }
            ExecutionOutcome::Retry { at, retry_count, .. } => {
                self.write_or_defer(PendingWrite::Reschedule(NewTrigger {
                    key: trigger.key.clone(),
                    job_type: trigger.job_type.clone(),
                    job_data: trigger.job_data.clone(),
                    fire_at: at,
                    retry_count,
                    max_retries: trigger.max_retries,
                }));
                self.write_or_defer(PendingWrite::CompleteTrigger {
                    id: trigger.id.clone(),
                    fired_at: trigger.claimed_at,
                });
            }
            ExecutionOutcome::Succeeded { .. }
            | ExecutionOutcome::Failed { .. }
            | ExecutionOutcome::Cancelled { .. } => {
                self.write_or_defer(PendingWrite::CompleteTrigger {
                    id: trigger.id.clone(),
                    fired_at: trigger.claimed_at,
                });
            }
        }

        if let Some(lease) = lease {
            self.write_or_defer(PendingWrite::ReleaseLease(lease));
        }
    }

    fn apply(&self, write: &PendingWrite) -> Result<()> {
        let triggers = &self.inner.triggers;
        match write {
            PendingWrite::Reschedule(new) => {
                let id = triggers.insert_trigger(new)?;
                info!(
                    trigger_id = %id,
                    job_name = %new.key.name,
                    job_group = %new.key.group,
                    retry_count = new.retry_count,
                    fire_at = %new.fire_at,
                    "retry trigger scheduled"
                );
            }
            PendingWrite::CompleteTrigger { id, fired_at } => {
                triggers.complete_trigger(id, *fired_at)?;
            }
            PendingWrite::ReleaseTrigger(id) => match triggers.release_trigger(id) {
                // Recovery already moved it.
                Err(SchedulerError::TriggerNotFound { .. }) => {}
                other => other?,
            },
            PendingWrite::ReleaseLease(lease) => {
                self.release_lease(lease)?;
            }
        }
        Ok(())
    }

    fn write_or_defer(&self, write: PendingWrite) {
        if let Err(e) = self.apply(&write) {
            warn!(node_id = %self.node_id(), error = %e, write = ?write, "store write deferred");
            if let Ok(mut pending) = self.inner.pending.lock() {
                pending.push(write);
            }
        }
    }

    fn flush_pending(&self) {
        let written = self.inner.history.flush_deferred();
        if written > 0 {
            info!(node_id = %self.node_id(), written, "deferred history completions written");
        }
        let writes = match self.inner.pending.lock() {
            Ok(mut pending) if !pending.is_empty() => std::mem::take(&mut *pending),
            _ => return,
        };
        let mut failed = Vec::new();
        for write in writes {
            if let Err(e) = self.apply(&write) {
                debug!(error = %e, "deferred store write still failing");
                failed.push(write);
            }
        }
        if !failed.is_empty() {
            if let Ok(mut pending) = self.inner.pending.lock() {
                failed.append(&mut pending);
                *pending = failed;
            }
        }
    }

    /// Number of store writes, history completions included, waiting for
    /// the store to come back.
    pub fn pending_writes(&self) -> usize {
        let triggers = self.inner.pending.lock().map(|p| p.len()).unwrap_or(0);
        triggers + self.inner.history.deferred_completions()
    }

    // --- leases ------------------------------------------------------------

    /// Claim the right to run `key` now. At most one lease per identity is
    /// outstanding across every node sharing the store.
    pub fn acquire_for_execution(
        &self,
        key: &JobKey,
        fire_instance_id: &FireInstanceId,
    ) -> Result<LeaseAttempt> {
        let now = db::now();
        self.inner.triggers.acquire_lease(
            key,
            self.node_id(),
            fire_instance_id,
            self.inner.settings.stale_cutoff(now),
        )
    }

    /// Release a lease and let blocked triggers of its identity be claimed.
    pub fn release_lease(&self, lease: &Lease) -> Result<bool> {
        let released = self.inner.triggers.release_lease(lease)?;
        if !released {
            warn!(
                job_name = %lease.key.name,
                job_group = %lease.key.group,
                lease_id = %lease.lease_id,
                "lease was already reclaimed"
            );
        }
        let unblocked = self.inner.triggers.unblock(&lease.key)?;
        if unblocked > 0 {
            debug!(job_name = %lease.key.name, job_group = %lease.key.group, unblocked, "blocked triggers released");
        }
        Ok(released)
    }

    // --- scheduling --------------------------------------------------------

    /// Register (or refresh) a durable job identity. Idempotent; call it on
    /// every node startup.
    pub fn register_durable_job(&self, def: &JobDefinition) -> Result<()> {
        if !self.inner.registry.contains(&def.job_type) {
            warn!(
                job_type = %def.job_type,
                "registering a job type this node cannot execute"
            );
        }
        self.inner.triggers.upsert_definition(def)?;
        info!(
            job_name = %def.key.name,
            job_group = %def.key.group,
            job_type = %def.job_type,
            max_retries = def.max_retries,
            disallow_concurrent = def.disallow_concurrent,
            "durable job registered"
        );
        Ok(())
    }

    /// Create a one-shot trigger for `key` firing at or after `fire_at`.
    ///
    /// Parameters are validated here; a trigger is never stored for
    /// parameters its payload would reject.
    pub fn schedule_once<J: Job>(
        &self,
        key: &JobKey,
        params: &J::Params,
        fire_at: DateTime<Utc>,
    ) -> Result<TriggerId> {
        params.validate().map_err(SchedulerError::InvalidParams)?;
        let def = self
            .inner
            .triggers
            .definition(key)?
            .ok_or_else(|| SchedulerError::JobNotRegistered(key.to_string()))?;
        if def.job_type != J::JOB_TYPE {
            return Err(SchedulerError::InvalidParams(format!(
                "job {key} runs {}, not {}",
                def.job_type,
                J::JOB_TYPE
            )));
        }

        let job_data = serde_json::to_string(params)?;
        let id = self.inner.triggers.insert_trigger(&NewTrigger {
            key: key.clone(),
            job_type: def.job_type,
            job_data,
            fire_at,
            retry_count: 0,
            max_retries: def.max_retries,
        })?;
        info!(
            trigger_id = %id,
            job_name = %key.name,
            job_group = %key.group,
            fire_at = %fire_at,
            "job scheduled"
        );
        Ok(id)
    }

    pub fn schedule_now<J: Job>(&self, key: &JobKey, params: &J::Params) -> Result<TriggerId> {
        self.schedule_once::<J>(key, params, db::now())
    }

    pub fn schedule_after<J: Job>(
        &self,
        key: &JobKey,
        params: &J::Params,
        delay: Duration,
    ) -> Result<TriggerId> {
        self.schedule_once::<J>(key, params, db::now() + to_chrono(delay))
    }

    /// Delete a trigger that has not fired. Returns false if there was
    /// nothing to cancel.
    pub fn cancel_trigger(&self, id: &TriggerId) -> Result<bool> {
        let cancelled = self.inner.triggers.cancel_trigger(id)?;
        if cancelled {
            info!(trigger_id = %id, "trigger cancelled");
        }
        Ok(cancelled)
    }

    pub fn pause_trigger(&self, id: &TriggerId) -> Result<bool> {
        self.inner.triggers.pause_trigger(id)
    }

    pub fn resume_trigger(&self, id: &TriggerId) -> Result<bool> {
        self.inner.triggers.resume_trigger(id)
    }

    pub fn trigger_info(&self, id: &TriggerId) -> Result<Option<TriggerDescriptor>> {
        self.inner.triggers.get_trigger(id)
    }

    pub fn list_triggers(&self, filter: &TriggerFilter) -> Result<Vec<TriggerDescriptor>> {
        self.inner.triggers.list_triggers(filter)
    }

    /// Raise the cancellation signal of an execution running on this node.
    pub fn cancel_execution(&self, fire_instance_id: &FireInstanceId) -> bool {
        match self.inner.running.get(fire_instance_id) {
            Some(token) => {
                token.cancel();
                info!(fire_instance_id = %fire_instance_id, "execution cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Fire instance ids currently executing on this node.
    pub fn running_executions(&self) -> Vec<FireInstanceId> {
        self.inner.running.iter().map(|e| e.key().clone()).collect()
    }
}
