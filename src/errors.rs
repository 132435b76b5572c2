//! Typed error hierarchy for the foundry worker.
//!
//! Three top-level enums cover the three external boundaries:
//! - `QueueError`: shared-queue claim/update/sweep failures
//! - `PatchError`: branch, edit, and pull-request publication failures
//! - `MailError`: SMTP composition and transport failures

use thiserror::Error;

/// Errors from the shared job queue engine.
///
/// A queue error aborts the current worker cycle; it is logged and the loop
/// continues with the next cycle.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Queue returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode queue response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors from branch management and patch application.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Target file not found for replacement: {path}")]
    MissingTarget { path: String },

    #[error("Invalid {kind} record: {reason}")]
    InvalidRecord { kind: &'static str, reason: String },

    #[error("GitHub operation '{operation}' failed for {subject}: {source}")]
    Api {
        operation: &'static str,
        subject: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PatchError {
    pub fn api(operation: &'static str, subject: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Api {
            operation,
            subject: subject.into(),
            source,
        }
    }
}

/// Errors from the outbound mail transport.
///
/// Mail failures are never fatal: the reconciler logs them and leaves
/// `user_emailed` false so a later pass retries.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("Invalid mail address or headers: {0}")]
    Compose(String),

    #[error("SMTP send failed: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_error_status_carries_code_and_body() {
        let err = QueueError::Status {
            status: 503,
            body: "service unavailable".to_string(),
        };
        match &err {
            QueueError::Status { status, body } => {
                assert_eq!(*status, 503);
                assert_eq!(body, "service unavailable");
            }
            _ => panic!("Expected Status variant"),
        }
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn patch_error_missing_target_names_the_path() {
        let err = PatchError::MissingTarget {
            path: "src/app.tsx".to_string(),
        };
        assert!(err.to_string().contains("src/app.tsx"));
    }

    #[test]
    fn patch_error_api_carries_operation_and_subject() {
        let err = PatchError::api("create_ref", "acme/site", anyhow::anyhow!("403 Forbidden"));
        let text = err.to_string();
        assert!(text.contains("create_ref"));
        assert!(text.contains("acme/site"));
    }

    #[test]
    fn mail_error_variants_are_distinct() {
        let compose = MailError::Compose("bad address".into());
        let transport = MailError::Transport("connection refused".into());
        assert!(matches!(compose, MailError::Compose(_)));
        assert!(matches!(transport, MailError::Transport(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&QueueError::Status {
            status: 500,
            body: String::new(),
        });
        assert_std_error(&PatchError::MissingTarget {
            path: "x".to_string(),
        });
        assert_std_error(&MailError::Transport("x".to_string()));
    }
}
