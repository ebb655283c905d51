use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// UUIDv7: time-sortable, so ids read in creation order in logs.
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Primary key of one execution history row.
    RecordId
);
string_id!(
    /// One scheduled occurrence of a job identity.
    TriggerId
);
string_id!(
    /// One physical firing. Unique across every history record.
    FireInstanceId
);

/// The (name, group) pair identifying a logical unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Outcome of one execution attempt, as recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The attempt is in progress. The only non-terminal state.
    Running,
    Success,
    /// Terminal for this record; a new attempt has been scheduled.
    FailedWillRetry,
    /// Failed with no retry budget left, or failed permanently.
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::FailedWillRetry => "failed_will_retry",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed_will_retry" => Ok(ExecutionStatus::FailedWillRetry),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Live state of a trigger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Waiting for its `next_fire_at`.
    Waiting,
    /// Claimed by a node, about to run or running.
    Acquired,
    /// Claimed while another execution of the same identity held the lease.
    Blocked,
    /// Held back by an operator; never claimed.
    Paused,
    /// Fired. One-shot triggers never leave this state.
    Complete,
    /// The claiming node had no payload registered for the job type.
    Error,
}

impl TriggerState {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerState::Waiting => "waiting",
            TriggerState::Acquired => "acquired",
            TriggerState::Blocked => "blocked",
            TriggerState::Paused => "paused",
            TriggerState::Complete => "complete",
            TriggerState::Error => "error",
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TriggerState::Waiting),
            "acquired" => Ok(TriggerState::Acquired),
            "blocked" => Ok(TriggerState::Blocked),
            "paused" => Ok(TriggerState::Paused),
            "complete" => Ok(TriggerState::Complete),
            "error" => Ok(TriggerState::Error),
            other => Err(format!("unknown trigger state: {other}")),
        }
    }
}

/// One row of execution history: a single physical attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: RecordId,
    pub job_name: String,
    pub job_group: String,
    /// Payload identity, e.g. `email.send_verification`.
    pub job_type: String,
    /// Serialized parameters exactly as stored on the trigger.
    pub job_data: Option<String>,
    pub fire_instance_id: FireInstanceId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    /// `None` iff `status == Running`.
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    /// Attempts already made before this one (0 = first attempt).
    pub retry_count: u32,
    pub max_retries: u32,
    /// Set only on `FailedWillRetry` records.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub result_data: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn job_key(&self) -> JobKey {
        JobKey::new(&self.job_name, &self.job_group)
    }
}

/// Fields needed to open a `Running` history record.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub key: JobKey,
    pub job_type: String,
    pub job_data: Option<String>,
    pub fire_instance_id: FireInstanceId,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// How a record is closed.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// When the attempt finished. `None` means the time of the write; a
    /// buffered completion sets it so a late write keeps the real duration.
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub result_data: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// What [`crate::HistoryStore::complete`] wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed {
    pub completed_at: DateTime<Utc>,
    /// The retry time as stored, after clamping it past `completed_at`.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Read-only history lookup for operators. Empty filter = everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub job_name: Option<String>,
    pub job_group: Option<String>,
    pub status: Option<ExecutionStatus>,
    /// Inclusive lower bound on `started_at`.
    pub started_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`.
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// The scheduler's live view of one trigger, exposed read-only to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    pub trigger_id: TriggerId,
    pub job_name: String,
    pub job_group: String,
    pub job_type: String,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub state: TriggerState,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Node currently holding the claim, if any.
    pub claimed_by: Option<String>,
}

impl TriggerDescriptor {
    pub fn job_key(&self) -> JobKey {
        JobKey::new(&self.job_name, &self.job_group)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TriggerFilter {
    pub job_name: Option<String>,
    pub job_group: Option<String>,
    pub state: Option<TriggerState>,
    pub limit: Option<u32>,
}
