use std::sync::Arc;

use async_trait::async_trait;
use cinejobs_scheduler::{Job, JobContext, JobDefinition, JobError, JobKey, JobParams};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::sender::EmailSender;

pub const JOB_NAME: &str = "SendEmailVerificationJob";
pub const JOB_GROUP: &str = "Email";

/// Parameters of one verification mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmailVerificationParams {
    pub email: String,
    pub username: String,
    pub token: String,
}

impl EmailVerificationParams {
    pub fn new(
        email: impl Into<String>,
        username: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            username: username.into(),
            token: token.into(),
        }
    }
}

impl JobParams for EmailVerificationParams {
    fn validate(&self) -> Result<(), String> {
        let missing: Vec<&str> = [
            ("email", &self.email),
            ("username", &self.username),
            ("token", &self.token),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect();
        if !missing.is_empty() {
            return Err(format!("missing required parameters: {}", missing.join(", ")));
        }
        Ok(())
    }
}

pub fn job_key() -> JobKey {
    JobKey::new(JOB_NAME, JOB_GROUP)
}

/// Durable registration: never two verification sends at once, retried up
/// to `max_retries` times (`[retry] max_retries`).
pub fn definition(max_retries: u32) -> JobDefinition {
    JobDefinition::of::<SendEmailVerificationJob>(job_key())
        .max_retries(max_retries)
        .disallow_concurrent()
}

/// Sends one verification mail through the configured [`EmailSender`].
pub struct SendEmailVerificationJob {
    sender: Arc<dyn EmailSender>,
}

impl SendEmailVerificationJob {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Job for SendEmailVerificationJob {
    type Params = EmailVerificationParams;
    const JOB_TYPE: &'static str = "email.send_verification";

    async fn execute(
        &self,
        params: EmailVerificationParams,
        ctx: &JobContext,
    ) -> Result<Option<serde_json::Value>, JobError> {
        info!(
            email = %params.email,
            username = %params.username,
            fire_instance_id = %ctx.fire_instance_id,
            "sending email verification"
        );
        self.sender
            .send(&params.email, &params.username, &params.token, &ctx.cancel)
            .await?;
        Ok(Some(serde_json::json!({ "recipient": params.email })))
    }
}
