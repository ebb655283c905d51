//! The single place that turns a payload's result into history.
//!
//! Payload failures never escape [`instrumented_execute`]: every attempt
//! that gets a `Running` record leaves with a terminal one.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tracing::{error, info, warn};

use crate::error::SchedulerError;
use crate::history::HistoryStore;
use crate::job::{JobContext, JobError};
use crate::retry::RetryPolicy;
use crate::types::{Closed, Completion, ExecutionStatus, NewExecution, RecordId};

/// Attempts made to close a history record before giving up on it.
const COMPLETE_ATTEMPTS: u32 = 5;
const COMPLETE_BACKOFF: Duration = Duration::from_millis(200);

/// What the scheduler must do after one attempt.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Succeeded {
        record_id: RecordId,
    },
    /// Terminal failure. Nothing is rescheduled.
    Failed {
        record_id: RecordId,
        error: String,
    },
    /// Schedule a new physical attempt at `at` carrying `retry_count`.
    Retry {
        record_id: RecordId,
        at: DateTime<Utc>,
        retry_count: u32,
    },
    Cancelled {
        record_id: RecordId,
    },
    /// The history record could not be opened, so the payload never ran.
    Deferred {
        error: SchedulerError,
    },
}

impl ExecutionOutcome {
    pub fn status(&self) -> Option<ExecutionStatus> {
        match self {
            ExecutionOutcome::Succeeded { .. } => Some(ExecutionStatus::Success),
            ExecutionOutcome::Failed { .. } => Some(ExecutionStatus::Failed),
            ExecutionOutcome::Retry { .. } => Some(ExecutionStatus::FailedWillRetry),
            ExecutionOutcome::Cancelled { .. } => Some(ExecutionStatus::Cancelled),
            ExecutionOutcome::Deferred { .. } => None,
        }
    }

    pub fn record_id(&self) -> Option<&RecordId> {
        match self {
            ExecutionOutcome::Succeeded { record_id }
            | ExecutionOutcome::Failed { record_id, .. }
            | ExecutionOutcome::Retry { record_id, .. }
            | ExecutionOutcome::Cancelled { record_id } => Some(record_id),
            ExecutionOutcome::Deferred { .. } => None,
        }
    }
}

/// Run `payload` under history recording and the retry policy.
///
/// 1. open a `Running` record (if that fails the payload is not run);
/// 2. run the payload, catching panics;
/// 3. classify the result and close the record.
pub async fn instrumented_execute<F, Fut>(
    history: &HistoryStore,
    retry: &RetryPolicy,
    ctx: &JobContext,
    payload: F,
) -> ExecutionOutcome
where
    F: FnOnce(JobContext) -> Fut,
    Fut: Future<Output = Result<Option<String>, JobError>>,
{
    let new = NewExecution {
        key: ctx.key.clone(),
        job_type: ctx.job_type.clone(),
        job_data: Some(ctx.job_data.clone()),
        fire_instance_id: ctx.fire_instance_id.clone(),
        retry_count: ctx.retry_count,
        max_retries: ctx.max_retries,
    };
    let record_id = match history.begin(&new) {
        Ok(id) => id,
        Err(e) => {
            warn!(
                job_name = %ctx.key.name,
                job_group = %ctx.key.group,
                fire_instance_id = %ctx.fire_instance_id,
                error = %e,
                "could not open history record; attempt deferred"
            );
            return ExecutionOutcome::Deferred { error: e };
        }
    };

    info!(
        job_name = %ctx.key.name,
        job_group = %ctx.key.group,
        fire_instance_id = %ctx.fire_instance_id,
        retry_count = ctx.retry_count,
        "job started"
    );

    let result = match AssertUnwindSafe(payload(ctx.clone())).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(JobError::Transient(format!(
            "job panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };

    let (status, completion, mut outcome) = classify(&record_id, retry, ctx, result);
    if let Some(closed) = close_record(history, &record_id, status, completion, ctx).await {
        // The trigger must fire at the retry time the audit trail shows.
        if let (ExecutionOutcome::Retry { at, .. }, Some(stored)) = (&mut outcome, closed.next_retry_at) {
            *at = stored;
        }
    }

    match &outcome {
        ExecutionOutcome::Succeeded { .. } => info!(
            job_name = %ctx.key.name,
            job_group = %ctx.key.group,
            fire_instance_id = %ctx.fire_instance_id,
            "job succeeded"
        ),
        ExecutionOutcome::Retry { at, retry_count, .. } => warn!(
            job_name = %ctx.key.name,
            job_group = %ctx.key.group,
            fire_instance_id = %ctx.fire_instance_id,
            retry_count = *retry_count,
            next_retry_at = %at,
            "job failed; retry scheduled"
        ),
        ExecutionOutcome::Failed { error: err, .. } => error!(
            job_name = %ctx.key.name,
            job_group = %ctx.key.group,
            fire_instance_id = %ctx.fire_instance_id,
            retry_count = ctx.retry_count,
            error = %err,
            "job failed permanently"
        ),
        ExecutionOutcome::Cancelled { .. } => info!(
            job_name = %ctx.key.name,
            job_group = %ctx.key.group,
            fire_instance_id = %ctx.fire_instance_id,
            "job cancelled"
        ),
        ExecutionOutcome::Deferred { .. } => {}
    }
    outcome
}

fn classify(
    record_id: &RecordId,
    retry: &RetryPolicy,
    ctx: &JobContext,
    result: Result<Option<String>, JobError>,
) -> (ExecutionStatus, Completion, ExecutionOutcome) {
    let record_id = record_id.clone();
    let completed_at = crate::db::now();
    let err = match result {
        Ok(result_data) => {
            return (
                ExecutionStatus::Success,
                Completion {
                    completed_at: Some(completed_at),
                    result_data,
                    ..Default::default()
                },
                ExecutionOutcome::Succeeded { record_id },
            )
        }
        Err(err) => err,
    };

    let failure = |next_retry_at| Completion {
        completed_at: Some(completed_at),
        error_message: Some(err.to_string()),
        stack_trace: Some(format!("{err:?}")),
        result_data: None,
        next_retry_at,
    };

    // An error returned after the signal was raised counts as honouring it.
    if matches!(err, JobError::Cancelled) || ctx.cancel.is_cancelled() {
        return (
            ExecutionStatus::Cancelled,
            failure(None),
            ExecutionOutcome::Cancelled { record_id },
        );
    }

    if err.is_retryable() && RetryPolicy::should_retry(ctx.retry_count, ctx.max_retries) {
        let at = retry.next_retry_at(completed_at, ctx.retry_count);
        return (
            ExecutionStatus::FailedWillRetry,
            failure(Some(at)),
            ExecutionOutcome::Retry {
                record_id,
                at,
                retry_count: ctx.retry_count + 1,
            },
        );
    }

    (
        ExecutionStatus::Failed,
        failure(None),
        ExecutionOutcome::Failed {
            record_id,
            error: err.to_string(),
        },
    )
}

/// Close the record, retrying while the store is unreachable. A terminal
/// status that still cannot be written is handed to
/// [`HistoryStore::defer_completion`] so it is written once the store is back.
async fn close_record(
    history: &HistoryStore,
    record_id: &RecordId,
    status: ExecutionStatus,
    completion: Completion,
    ctx: &JobContext,
) -> Option<Closed> {
    let mut delay = COMPLETE_BACKOFF;
    for attempt in 1..=COMPLETE_ATTEMPTS {
        match history.complete(record_id, status, completion.clone()) {
            Ok(closed) => return closed,
            Err(e @ SchedulerError::InvalidTransition(_)) | Err(e @ SchedulerError::RecordNotFound { .. }) => {
                error!(record_id = %record_id, %status, error = %e, "history record rejected completion");
                return None;
            }
            Err(e) if attempt < COMPLETE_ATTEMPTS => {
                warn!(
                    record_id = %record_id,
                    attempt,
                    error = %e,
                    "history write failed; retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                error!(
                    record_id = %record_id,
                    job_name = %ctx.key.name,
                    job_group = %ctx.key.group,
                    fire_instance_id = %ctx.fire_instance_id,
                    %status,
                    error_message = completion.error_message.as_deref().unwrap_or(""),
                    error = %e,
                    "history write failed; completion buffered until the store is back"
                );
                history.defer_completion(record_id.clone(), status, completion.clone());
            }
        }
    }
    None
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
