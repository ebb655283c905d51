use cinejobs_scheduler::JobError;
use thiserror::Error;

/// Failures of the email-sending collaborator.
#[derive(Debug, Error)]
pub enum EmailError {
    #[error("Invalid email address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Could not build message: {0}")]
    Build(String),

    #[error("SMTP is not configured: {0}")]
    NotConfigured(String),

    #[error("SMTP send failed: {0}")]
    Transport(String),

    #[error("Send cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EmailError>;

impl From<EmailError> for JobError {
    fn from(e: EmailError) -> Self {
        match e {
            EmailError::Cancelled => JobError::Cancelled,
            // The recipient will never parse, however often we retry.
            EmailError::InvalidAddress { .. } => JobError::InvalidParams(e.to_string()),
            other => JobError::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_problems_are_retryable() {
        let bad = EmailError::InvalidAddress {
            address: "nope".into(),
            reason: "missing @".into(),
        };
        assert!(!JobError::from(bad).is_retryable());
        assert!(matches!(JobError::from(EmailError::Cancelled), JobError::Cancelled));
        assert!(JobError::from(EmailError::Transport("421".into())).is_retryable());
    }
}
