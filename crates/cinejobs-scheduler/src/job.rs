use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinejobs_core::config::DEFAULT_MAX_RETRIES;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::types::{FireInstanceId, JobKey, TriggerId};

/// Typed parameters of one job type.
///
/// Serialized to the trigger's opaque `job_data` only at the store
/// boundary; validated once when a trigger is created.
pub trait JobParams: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// How a payload signals that it did not complete.
#[derive(Debug, Error)]
pub enum JobError {
    /// I/O or collaborator failure; retried while budget remains.
    #[error("{0}")]
    Transient(String),

    /// The parameters can never succeed. Terminal, does not consume retries.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The payload observed its cancellation signal and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    pub fn transient(e: impl fmt::Display) -> Self {
        JobError::Transient(e.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }
}

/// Everything a payload learns about the firing it runs in.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub key: JobKey,
    pub job_type: String,
    pub trigger_id: TriggerId,
    pub fire_instance_id: FireInstanceId,
    pub fired_at: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    /// Attempts already made for this occurrence (0 on the first run).
    pub retry_count: u32,
    pub max_retries: u32,
    pub job_data: String,
    /// Raised on node shutdown or an operator cancel. Payloads check it at
    /// their own I/O boundaries; nothing kills a payload that ignores it.
    pub cancel: CancellationToken,
}

/// A unit of work with a typed parameter contract.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    type Params: JobParams;

    /// Stable payload identity, persisted on every trigger and history row.
    const JOB_TYPE: &'static str;

    /// Returns optional result data, stored on the `Success` record.
    async fn execute(
        &self,
        params: Self::Params,
        ctx: &JobContext,
    ) -> Result<Option<serde_json::Value>, JobError>;
}

/// Durable registration of a job identity: plain configuration data,
/// shared by every node through the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub key: JobKey,
    pub job_type: String,
    pub max_retries: u32,
    /// At most one execution of this identity runs at a time, cluster-wide.
    pub disallow_concurrent: bool,
}

impl JobDefinition {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            disallow_concurrent: false,
        }
    }

    pub fn of<J: Job>(key: JobKey) -> Self {
        Self::new(key, J::JOB_TYPE)
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn disallow_concurrent(mut self) -> Self {
        self.disallow_concurrent = true;
        self
    }
}

/// Type-erased payload the scheduler can hold in a map.
#[async_trait]
pub trait ErasedJob: Send + Sync {
    /// Decodes `ctx.job_data`, runs the payload and encodes its result.
    async fn run(&self, ctx: &JobContext) -> Result<Option<String>, JobError>;
}

struct TypedJob<J>(J);

#[async_trait]
impl<J: Job> ErasedJob for TypedJob<J> {
    async fn run(&self, ctx: &JobContext) -> Result<Option<String>, JobError> {
        let params: J::Params = serde_json::from_str(&ctx.job_data)
            .map_err(|e| JobError::InvalidParams(e.to_string()))?;
        params.validate().map_err(JobError::InvalidParams)?;
        let result = self.0.execute(params, ctx).await?;
        Ok(result.map(|v| v.to_string()))
    }
}

/// Payload implementations known to this node, keyed by job type.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn ErasedJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload. A later registration of the same type replaces
    /// the earlier one.
    pub fn register<J: Job>(&mut self, job: J) -> &mut Self {
        self.jobs
            .insert(J::JOB_TYPE.to_string(), Arc::new(TypedJob(job)));
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn ErasedJob>> {
        self.jobs.get(job_type).cloned()
    }

    /// Like [`JobRegistry::get`], failing with
    /// [`SchedulerError::UnknownJobType`] when nothing is registered.
    pub fn resolve(&self, job_type: &str) -> Result<Arc<dyn ErasedJob>, SchedulerError> {
        self.get(job_type)
            .ok_or_else(|| SchedulerError::UnknownJobType(job_type.to_string()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.jobs.contains_key(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}
