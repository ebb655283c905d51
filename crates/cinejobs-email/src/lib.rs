//! `cinejobs-email`: the email-verification job and the facade that
//! schedules it.
//!
//! A node wires it up in three steps: build a sender with
//! [`service::sender_from_config`], add the payload to its registry with
//! [`service::register_payloads`], and after connecting store the durable
//! definition with [`service::register_definitions`].

pub mod error;
pub mod job;
pub mod sender;
pub mod service;

pub use error::EmailError;
pub use job::{EmailVerificationParams, SendEmailVerificationJob};
pub use sender::{EmailSender, LogEmailSender, SmtpEmailSender};
pub use service::JobSchedulerService;
