//! Shared types: the `Job` row, per-transition update payloads, change-set
//! records, and the pull-request reference value type.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::PatchError;

/// Lifecycle status of a job in the shared queue.
///
/// Only the queue engine's claim procedure moves pending→claimed; only the
/// execution envelope moves claimed→done/failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// One feature-request row from the shared queue.
///
/// Wire field names follow the queue table. Free-text fields may be null in
/// the table, so they deserialize as options; use the accessor methods for
/// trimmed, never-null views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub pr_merged: bool,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub should_email_user: bool,
    #[serde(default)]
    pub user_emailed: bool,
    #[serde(default)]
    pub retry_count: i64,
    #[serde(default)]
    pub agent_output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agent_run_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn message_text(&self) -> &str {
        self.message.as_deref().unwrap_or("").trim()
    }

    pub fn requester_name(&self) -> &str {
        self.name.as_deref().unwrap_or("").trim()
    }

    pub fn requester_email(&self) -> &str {
        self.email.as_deref().unwrap_or("").trim()
    }
}

// ── Per-transition update payloads ─────────────────────────────────
//
// Each terminal or reconciliation transition is one atomic `update` call
// carrying every field for that transition. These structs are the canonical
// payloads; nothing in the worker ever splits a transition across two calls.

/// Fields written when a job completes successfully.
/// `error` is serialized as an explicit null to clear any earlier failure.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionUpdate {
    pub status: JobStatus,
    pub agent_run_at: DateTime<Utc>,
    pub pr_url: Option<String>,
    pub agent_output: serde_json::Value,
    pub error: Option<String>,
}

/// Fields written when the generation step fails.
#[derive(Debug, Clone, Serialize)]
pub struct FailureUpdate {
    pub status: JobStatus,
    pub agent_run_at: DateTime<Utc>,
    pub error: String,
    pub retry_count: i64,
}

/// Fields written when a merge is observed. `user_emailed` rides along in the
/// same call only when a notification send was confirmed, so merge-state
/// recording is never blocked by mail-transport failure.
#[derive(Debug, Clone, Serialize)]
pub struct MergeUpdate {
    pub pr_merged: bool,
    pub merged_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_emailed: Option<bool>,
}

/// Fields written by the pending-notification pass after a confirmed send.
#[derive(Debug, Clone, Serialize)]
pub struct NotifiedUpdate {
    pub user_emailed: bool,
}

// ── Generation-step input ──────────────────────────────────────────

const TITLE_DISPLAY_LIMIT: usize = 72;

/// Input payload handed to the opaque generation step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratorInput {
    pub title: String,
    pub description: String,
    pub user_requirements: String,
    pub priority: String,
    pub additional_context: String,
    pub repository_reference: String,
}

impl GeneratorInput {
    /// Build the generation-step input deterministically from job fields.
    pub fn from_job(job: &Job, repo_url: &str) -> Self {
        let message = job.message_text();
        let name = job.requester_name();
        let email = job.requester_email();

        let title = if message.is_empty() {
            "User feedback".to_string()
        } else {
            truncate_with_ellipsis(message, TITLE_DISPLAY_LIMIT)
        };

        let description = if message.is_empty() {
            format!(
                "Feedback from {} <{}>",
                if name.is_empty() { "anonymous" } else { name },
                if email.is_empty() { "unknown" } else { email },
            )
        } else {
            message.to_string()
        };

        Self {
            title,
            description,
            user_requirements: String::new(),
            priority: "medium".to_string(),
            additional_context: format!("Submitted by: {} <{}>", name, email),
            repository_reference: repo_url.to_string(),
        }
    }
}

/// Truncate to at most `max` characters, appending `…` when truncated.
pub fn truncate_with_ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    } else {
        s.to_string()
    }
}

// ── Change-set records ─────────────────────────────────────────────

/// A bounded find/replace operation against one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SurgicalEdit {
    pub path: String,
    pub find_text: String,
    pub replace_text: String,
    #[serde(default)]
    pub count: Option<usize>,
}

impl SurgicalEdit {
    pub fn validate(&self) -> Result<(), PatchError> {
        if self.path.trim().is_empty() {
            return Err(PatchError::InvalidRecord {
                kind: "replacement",
                reason: "missing 'path'".to_string(),
            });
        }
        if self.find_text.is_empty() {
            return Err(PatchError::InvalidRecord {
                kind: "replacement",
                reason: format!("empty 'find_text' for {}", self.path),
            });
        }
        Ok(())
    }
}

/// A full-content file write, used only when no surgical edits are supplied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl FileWrite {
    pub fn validate(&self) -> Result<(), PatchError> {
        if self.path.trim().is_empty() {
            return Err(PatchError::InvalidRecord {
                kind: "change",
                reason: "missing 'path'".to_string(),
            });
        }
        Ok(())
    }
}

/// Everything needed to publish one pull request: branch naming, the change
/// set, and the PR title/body. Surgical replacements take hard precedence
/// over full-content changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestSpec {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub replacements: Vec<SurgicalEdit>,
    #[serde(default)]
    pub changes: Vec<FileWrite>,
}

impl PullRequestSpec {
    pub fn validate(&self) -> Result<(), PatchError> {
        if self.title.trim().is_empty() {
            return Err(PatchError::InvalidRecord {
                kind: "pull_request",
                reason: "missing 'title'".to_string(),
            });
        }
        for rep in &self.replacements {
            rep.validate()?;
        }
        for change in &self.changes {
            change.validate()?;
        }
        Ok(())
    }
}

// ── Pull-request reference ─────────────────────────────────────────

static PR_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://github\.com/([^/\s]+)/([^/\s]+)/pull/(\d+)").unwrap()
});

/// Parsed `{owner, repo, number}` reference to a hosted pull request.
/// Recomputed on demand from the stored URL, never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PullRequestRef {
    /// Parse a URL of the fixed shape
    /// `https://github.com/<owner>/<repo>/pull/<number>`.
    /// Anything else is rejected.
    pub fn parse(url: &str) -> Option<Self> {
        let caps = PR_REF.captures(url)?;
        Some(Self {
            owner: caps[1].to_string(),
            repo: caps[2].to_string(),
            number: caps[3].parse().ok()?,
        })
    }

    pub fn owner_repo(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl std::fmt::Display for PullRequestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}
