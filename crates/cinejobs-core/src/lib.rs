//! `cinejobs-core`: configuration and error types shared by every crate in
//! the background job workspace.

pub mod config;
pub mod error;

pub use config::CineJobsConfig;
pub use error::{CineJobsError, Result};
