use thiserror::Error;

#[derive(Debug, Error)]
pub enum CineJobsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CineJobsError {
    /// Short error code string used in operator-facing output.
    pub fn code(&self) -> &'static str {
        match self {
            CineJobsError::Config(_) => "CONFIG_ERROR",
            CineJobsError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CineJobsError>;
