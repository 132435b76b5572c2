//! Environment-style runtime configuration.
//!
//! The worker fails fast before entering its loop when a required value is
//! missing; everything mail-related is optional and its absence downgrades
//! notification sends to a skip.

use std::time::Duration;

use anyhow::{Context, Result, bail};

const DEFAULT_POLL_SECONDS: u64 = 5;
const DEFAULT_SMTP_PORT: u16 = 587;

/// Outbound-mail settings. `host` and a resolvable `from` address are both
/// required for sending; otherwise the mailer is not constructed.
#[derive(Debug, Clone, Default)]
pub struct MailConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: Option<String>,
}

impl MailConfig {
    /// The sender address: explicit `SMTP_FROM`, else the SMTP user.
    pub fn from_address(&self) -> Option<&str> {
        self.from.as_deref().or(self.user.as_deref())
    }
}

/// Runtime configuration for the worker process.
#[derive(Debug, Clone)]
pub struct Config {
    pub queue_url: String,
    pub queue_service_key: String,
    pub github_token: Option<String>,
    pub repo_url: String,
    /// Agent invocation (`AGENT_CMD`), split on whitespace; shell quoting is
    /// not interpreted.
    pub agent_cmd: String,
    pub mail: MailConfig,
    pub poll_interval: Duration,
    pub worker_id: String,
}

impl Config {
    /// Load configuration from the process environment, reading `.env` first
    /// if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Tests pass a map so
    /// they never touch process-global environment state.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let queue_url = require(&get, "QUEUE_URL")?;
        let queue_service_key = require(&get, "QUEUE_SERVICE_KEY")?;

        let poll_seconds = match get("POLL_DELAY_SECONDS") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("Invalid POLL_DELAY_SECONDS: {}", raw))?,
            None => DEFAULT_POLL_SECONDS,
        };

        let smtp_port = match get("SMTP_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("Invalid SMTP_PORT: {}", raw))?,
            None => DEFAULT_SMTP_PORT,
        };

        let worker_id = get("WORKER_ID")
            .or_else(|| get("HOSTNAME"))
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| format!("local-{}", uuid::Uuid::new_v4()));

        Ok(Self {
            queue_url: queue_url.trim_end_matches('/').to_string(),
            queue_service_key,
            github_token: get("GITHUB_TOKEN").filter(|v| !v.is_empty()),
            repo_url: get("GITHUB_REPO_URL").unwrap_or_default(),
            agent_cmd: get("AGENT_CMD").unwrap_or_else(|| "claude".to_string()),
            mail: MailConfig {
                host: get("SMTP_HOST").filter(|v| !v.is_empty()),
                port: smtp_port,
                user: get("SMTP_USER").filter(|v| !v.is_empty()),
                password: get("SMTP_PASS").filter(|v| !v.is_empty()),
                from: get("SMTP_FROM").filter(|v| !v.is_empty()),
            },
            poll_interval: Duration::from_secs(poll_seconds),
            worker_id,
        })
    }
}

fn require(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    match get(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("Missing required environment variable: {}", key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_config_requires_queue_url() {
        let result = Config::from_lookup(lookup(&[("QUEUE_SERVICE_KEY", "key")]));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("QUEUE_URL"));
    }

    #[test]
    fn test_config_requires_service_key() {
        let result = Config::from_lookup(lookup(&[("QUEUE_URL", "https://q.example.com")]));
        assert!(result.unwrap_err().to_string().contains("QUEUE_SERVICE_KEY"));
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("QUEUE_URL", "https://q.example.com/"),
            ("QUEUE_SERVICE_KEY", "key"),
        ]))
        .unwrap();
        assert_eq!(config.queue_url, "https://q.example.com");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.mail.port, 587);
        assert_eq!(config.agent_cmd, "claude");
        assert!(config.github_token.is_none());
        assert!(config.worker_id.starts_with("local-"));
    }

    #[test]
    fn test_config_reads_optional_values() {
        let config = Config::from_lookup(lookup(&[
            ("QUEUE_URL", "https://q.example.com"),
            ("QUEUE_SERVICE_KEY", "key"),
            ("GITHUB_TOKEN", "ghp_abc"),
            ("GITHUB_REPO_URL", "https://github.com/acme/site"),
            ("POLL_DELAY_SECONDS", "30"),
            ("WORKER_ID", "worker-7"),
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_PORT", "465"),
            ("SMTP_USER", "mailer"),
        ]))
        .unwrap();
        assert_eq!(config.github_token.as_deref(), Some("ghp_abc"));
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.worker_id, "worker-7");
        assert_eq!(config.mail.port, 465);
        assert_eq!(config.mail.from_address(), Some("mailer"));
    }

    #[test]
    fn test_config_rejects_bad_poll_interval() {
        let result = Config::from_lookup(lookup(&[
            ("QUEUE_URL", "https://q.example.com"),
            ("QUEUE_SERVICE_KEY", "key"),
            ("POLL_DELAY_SECONDS", "soon"),
        ]));
        assert!(result.unwrap_err().to_string().contains("POLL_DELAY_SECONDS"));
    }

    #[test]
    fn test_mail_from_prefers_explicit_from() {
        let mail = MailConfig {
            host: Some("smtp.example.com".to_string()),
            port: 587,
            user: Some("user@example.com".to_string()),
            password: None,
            from: Some("noreply@example.com".to_string()),
        };
        assert_eq!(mail.from_address(), Some("noreply@example.com"));
    }
}
