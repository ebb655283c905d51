//! The scheduling surface the rest of the application calls.

use std::sync::Arc;

use cinejobs_core::config::{RetryConfig, SmtpConfig};
use cinejobs_scheduler::{JobRegistry, Result, Scheduler, TriggerDescriptor, TriggerId};
use tracing::{info, warn};

use crate::job::{self, EmailVerificationParams, SendEmailVerificationJob};
use crate::sender::{EmailSender, LogEmailSender, SmtpEmailSender};

pub trait JobSchedulerService {
    /// Queue a verification mail to fire as soon as a worker is free.
    /// Returns the id of the stored trigger.
    fn schedule_email_verification(
        &self,
        email: &str,
        username: &str,
        token: &str,
    ) -> Result<TriggerId>;

    /// Delete a job that has not fired yet.
    fn cancel_job(&self, trigger_id: &TriggerId) -> Result<bool>;

    fn job_info(&self, trigger_id: &TriggerId) -> Result<Option<TriggerDescriptor>>;
}

impl JobSchedulerService for Scheduler {
    fn schedule_email_verification(
        &self,
        email: &str,
        username: &str,
        token: &str,
    ) -> Result<TriggerId> {
        let params = EmailVerificationParams::new(email, username, token);
        self.schedule_now::<SendEmailVerificationJob>(&job::job_key(), &params)
    }

    fn cancel_job(&self, trigger_id: &TriggerId) -> Result<bool> {
        self.cancel_trigger(trigger_id)
    }

    fn job_info(&self, trigger_id: &TriggerId) -> Result<Option<TriggerDescriptor>> {
        self.trigger_info(trigger_id)
    }
}

/// SMTP when a host is configured, otherwise a sender that only logs.
pub fn sender_from_config(config: &SmtpConfig) -> crate::error::Result<Arc<dyn EmailSender>> {
    if config.host.is_some() {
        Ok(Arc::new(SmtpEmailSender::from_config(config)?))
    } else {
        warn!("smtp.host is not set; verification emails will only be logged");
        Ok(Arc::new(LogEmailSender::new(config.verification_url.clone())))
    }
}

/// Add the email payloads to a node's registry.
pub fn register_payloads(registry: &mut JobRegistry, sender: Arc<dyn EmailSender>) {
    registry.register(SendEmailVerificationJob::new(sender));
}

/// Store the durable email job definitions with the configured retry
/// budget. Safe on every startup.
pub fn register_definitions(scheduler: &Scheduler, retry: &RetryConfig) -> Result<()> {
    scheduler.register_durable_job(&job::definition(retry.max_retries))?;
    info!(max_retries = retry.max_retries, "email jobs registered");
    Ok(())
}
