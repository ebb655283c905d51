use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The shared store could not be opened or migrated. Fatal at startup.
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job parameters were rejected before a trigger was created.
    #[error("Invalid job parameters: {0}")]
    InvalidParams(String),

    /// No payload is registered for the given job type on this node.
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// No durable job definition exists for this identity.
    #[error("Job not registered: {0}")]
    JobNotRegistered(String),

    /// A history record was asked to move to a state its invariants forbid.
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Trigger not found: {id}")]
    TriggerNotFound { id: String },

    #[error("Execution record not found: {id}")]
    RecordNotFound { id: String },

    /// A stored value could not be decoded (bad timestamp, unknown status).
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
