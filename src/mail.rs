//! Outbound notification mail over SMTP.
//!
//! Sending is strictly best-effort: a missing configuration means no mailer
//! is constructed and sends are skipped; a transport failure is reported to
//! the caller, which leaves the notification-dedup flag untouched so a later
//! reconciliation pass retries.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::config::MailConfig;
use crate::errors::MailError;

const SENDER_DISPLAY_NAME: &str = "Foundry";

/// Plain-text mail transport contract.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// SMTP-backed mailer. Port 465 uses implicit TLS; any other port negotiates
/// STARTTLS. Credentials are attached only when both user and password are
/// configured.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build a mailer from configuration, or `None` when the host or sender
    /// address is unset; an unconfigured transport is a skip, not an error.
    pub fn from_config(config: &MailConfig) -> Result<Option<Self>, MailError> {
        let (Some(host), Some(from)) = (config.host.as_deref(), config.from_address()) else {
            return Ok(None);
        };

        let builder = if config.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        }
        .map_err(|e| MailError::Transport(e.to_string()))?
        .port(config.port);

        let builder = match (&config.user, &config.password) {
            (Some(user), Some(password)) => {
                builder.credentials(Credentials::new(user.clone(), password.clone()))
            }
            _ => builder,
        };

        let from = format!("{} <{}>", SENDER_DISPLAY_NAME, from)
            .parse::<Mailbox>()
            .map_err(|e| MailError::Compose(format!("invalid from address '{}': {}", from, e)))?;

        debug!(host, port = config.port, "SMTP mailer configured");
        Ok(Some(Self {
            transport: builder.build(),
            from,
        }))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let to = to
            .parse::<Mailbox>()
            .map_err(|e| MailError::Compose(format!("invalid recipient '{}': {}", to, e)))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| MailError::Compose(e.to_string()))?;
        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_mail_yields_no_mailer() {
        let config = MailConfig::default();
        assert!(SmtpMailer::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_host_without_sender_yields_no_mailer() {
        let config = MailConfig {
            host: Some("smtp.example.com".to_string()),
            port: 587,
            user: None,
            password: None,
            from: None,
        };
        assert!(SmtpMailer::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_configured_mailer_is_constructed() {
        let config = MailConfig {
            host: Some("smtp.example.com".to_string()),
            port: 465,
            user: Some("mailer".to_string()),
            password: Some("secret".to_string()),
            from: Some("noreply@example.com".to_string()),
        };
        assert!(SmtpMailer::from_config(&config).unwrap().is_some());
    }

    #[test]
    fn test_bad_from_address_is_a_compose_error() {
        let config = MailConfig {
            host: Some("smtp.example.com".to_string()),
            port: 587,
            user: None,
            password: None,
            from: Some("not an address".to_string()),
        };
        let result = SmtpMailer::from_config(&config);
        assert!(matches!(result, Err(MailError::Compose(_))));
    }
}
