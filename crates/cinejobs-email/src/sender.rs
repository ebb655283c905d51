//! Email-sending collaborators.
//!
//! [`SmtpEmailSender`] delivers through lettre's async SMTP transport;
//! [`LogEmailSender`] only logs, for nodes without an SMTP host.

use std::time::Duration;

use async_trait::async_trait;
use cinejobs_core::config::{SmtpConfig, SmtpTls};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EmailError, Result};

pub const VERIFICATION_SUBJECT: &str = "CineSocial - Email Verification";

const VERIFICATION_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
</head>
<body style="font-family: Arial, sans-serif; padding: 20px;">
    <div style="max-width: 600px; margin: 0 auto;">
        <h2>Hello {{USERNAME}},</h2>
        <p>Welcome to CineSocial! Click the link below to verify your email address:</p>
        <p><a href="{{VERIFICATION_URL}}" style="background-color: #667eea; color: white; padding: 12px 24px; text-decoration: none; border-radius: 5px; display: inline-block;">Verify my email</a></p>
        <p>This link is valid for 24 hours.</p>
        <p>Regards,<br>The CineSocial Team</p>
    </div>
</body>
</html>"#;

/// Sends the verification mail for one account.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Deliver the verification link for `token` to `recipient`.
    ///
    /// Implementations stop at their next I/O boundary once `cancel` fires
    /// and return [`EmailError::Cancelled`].
    async fn send(
        &self,
        recipient: &str,
        display_name: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

pub fn verification_link(base_url: &str, token: &str) -> String {
    let sep = if base_url.contains('?') { '&' } else { '?' };
    format!("{base_url}{sep}token={token}")
}

/// HTML body of the verification mail.
pub fn render_verification(username: &str, link: &str) -> String {
    VERIFICATION_TEMPLATE
        .replace("{{USERNAME}}", &escape_html(username))
        .replace("{{VERIFICATION_URL}}", &escape_html(link))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub fn parse_address(address: &str) -> Result<Address> {
    address
        .trim()
        .parse::<Address>()
        .map_err(|e| EmailError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

pub struct SmtpEmailSender {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    verification_url: String,
    host: String,
}

impl SmtpEmailSender {
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let host = config
            .host
            .clone()
            .ok_or_else(|| EmailError::NotConfigured("smtp.host is not set".into()))?;
        let from_email = config
            .sender_address()
            .ok_or_else(|| EmailError::NotConfigured("smtp.from_email or smtp.username is required".into()))?;
        let from = Mailbox::new(Some(config.from_name.clone()), parse_address(from_email)?);

        let tls = match config.tls {
            SmtpTls::None => Tls::None,
            SmtpTls::Starttls => Tls::Opportunistic(tls_parameters(&host)?),
            SmtpTls::Tls => Tls::Wrapper(tls_parameters(&host)?),
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&host)
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)))
            .tls(tls);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        info!(host = %host, port = config.port, tls = ?config.tls, "SMTP sender configured");
        Ok(Self {
            mailer: builder.build(),
            from,
            verification_url: config.verification_url.clone(),
            host,
        })
    }

    fn build_message(&self, recipient: &str, display_name: &str, token: &str) -> Result<Message> {
        let to = Mailbox::new(Some(display_name.to_string()), parse_address(recipient)?);
        let link = verification_link(&self.verification_url, token);
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(VERIFICATION_SUBJECT)
            .header(ContentType::TEXT_HTML)
            .body(render_verification(display_name, &link))
            .map_err(|e| EmailError::Build(e.to_string()))
    }
}

fn tls_parameters(host: &str) -> Result<TlsParameters> {
    TlsParameters::builder(host.to_string())
        .build()
        .map_err(|e| EmailError::NotConfigured(format!("TLS configuration error: {e}")))
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(
        &self,
        recipient: &str,
        display_name: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let message = self.build_message(recipient, display_name, token)?;
        debug!(recipient, host = %self.host, "sending verification email");

        tokio::select! {
            _ = cancel.cancelled() => Err(EmailError::Cancelled),
            sent = self.mailer.send(message) => match sent {
                Ok(response) => {
                    info!(recipient, code = %response.code(), "verification email sent");
                    Ok(())
                }
                Err(e) => {
                    warn!(recipient, error = %e, "verification email failed");
                    Err(EmailError::Transport(e.to_string()))
                }
            },
        }
    }
}

/// Logs the mail it would have sent.
pub struct LogEmailSender {
    verification_url: String,
}

impl LogEmailSender {
    pub fn new(verification_url: impl Into<String>) -> Self {
        Self {
            verification_url: verification_url.into(),
        }
    }
}

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(
        &self,
        recipient: &str,
        display_name: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(EmailError::Cancelled);
        }
        parse_address(recipient)?;
        info!(
            recipient,
            display_name,
            link = %verification_link(&self.verification_url, token),
            "verification email not sent: no SMTP host configured"
        );
        Ok(())
    }
}
