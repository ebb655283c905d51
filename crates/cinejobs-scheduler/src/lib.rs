//! `cinejobs-scheduler`: cluster-aware one-shot job scheduler over a shared
//! SQLite store.
//!
//! # Overview
//!
//! Nodes that share a store and an instance name form one cluster. Each
//! node polls `job_triggers` for due rows, claims them with a conditional
//! update, takes the identity's lease when the job disallows concurrent
//! execution, and runs the payload through [`instrument::instrumented_execute`],
//! which records every attempt in `job_execution_history` and asks for a
//! retry while budget remains.
//!
//! | Table                   | Holds                                         |
//! |-------------------------|-----------------------------------------------|
//! | `job_execution_history` | one row per physical attempt                  |
//! | `job_definitions`       | durable job identities and their retry budget |
//! | `job_triggers`          | scheduled one-shot occurrences                |
//! | `job_leases`            | at most one row per running identity          |
//! | `scheduler_nodes`       | node check-ins used for liveness              |

pub mod db;
pub mod engine;
pub mod error;
pub mod history;
pub mod instrument;
pub mod job;
pub mod retry;
pub mod store;
pub mod types;

pub use db::Database;
pub use engine::{Scheduler, SchedulerSettings};
pub use error::{Result, SchedulerError};
pub use history::HistoryStore;
pub use instrument::{instrumented_execute, ExecutionOutcome};
pub use job::{Job, JobContext, JobDefinition, JobError, JobParams, JobRegistry};
pub use retry::RetryPolicy;
pub use store::{Lease, LeaseAttempt, TriggerStore};
pub use types::{
    Closed, Completion, ExecutionRecord, ExecutionStatus, FireInstanceId, HistoryFilter, JobKey,
    RecordId, TriggerDescriptor, TriggerFilter, TriggerId, TriggerState,
};
