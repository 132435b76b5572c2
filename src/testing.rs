//! Deterministic in-memory doubles for the worker's injected capabilities.
//!
//! Compiled into the crate (not `#[cfg(test)]`) so both unit tests and the
//! integration suite can drive full worker cycles without a queue engine, a
//! hosting API, an SMTP relay, or an agent subprocess.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{MailError, QueueError};
use crate::generator::GeneratorStep;
use crate::github::{PullSnapshot, PullSource, RepoFile, RepoHost};
use crate::mail::Mailer;
use crate::models::{GeneratorInput, Job, JobStatus};
use crate::queue::JobQueue;

/// A pending job row with every optional field unset.
pub fn job_fixture(id: &str) -> Job {
    Job {
        id: id.to_string(),
        status: JobStatus::Pending,
        message: None,
        name: None,
        email: None,
        pr_url: None,
        pr_merged: false,
        merged_at: None,
        should_email_user: false,
        user_emailed: false,
        retry_count: 0,
        agent_output: None,
        error: None,
        created_at: None,
        agent_run_at: None,
    }
}

// ── Queue ──────────────────────────────────────────────────────────

/// In-memory queue. One lock guards all rows, so a claim is atomic across
/// concurrent callers the same way the real stored procedure is.
#[derive(Default)]
pub struct MemoryQueue {
    rows: Mutex<Vec<Job>>,
    updates: Mutex<Vec<(String, Value)>>,
    fail_claims: Mutex<bool>,
}

pub fn memory_queue_with(jobs: Vec<Job>) -> Arc<MemoryQueue> {
    let queue = MemoryQueue::default();
    *queue.rows.lock().unwrap() = jobs;
    Arc::new(queue)
}

impl MemoryQueue {
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    /// Every `(job_id, fields)` update applied, in order.
    pub fn updates(&self) -> Vec<(String, Value)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn set_fail_claims(&self, fail: bool) {
        *self.fail_claims.lock().unwrap() = fail;
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn claim_next(&self, _worker_id: &str) -> Result<Option<Job>, QueueError> {
        if *self.fail_claims.lock().unwrap() {
            return Err(QueueError::Status {
                status: 503,
                body: "queue unavailable".to_string(),
            });
        }
        let mut rows = self.rows.lock().unwrap();
        for job in rows.iter_mut() {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Claimed;
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn update(&self, job_id: &str, fields: Value) -> Result<(), QueueError> {
        let mut rows = self.rows.lock().unwrap();
        let job = rows
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(QueueError::Status {
                status: 404,
                body: format!("no row {}", job_id),
            })?;
        let mut merged = serde_json::to_value(&*job)?;
        if let (Value::Object(target), Value::Object(patch)) = (&mut merged, &fields) {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        *job = serde_json::from_value(merged)?;
        self.updates.lock().unwrap().push((job_id.to_string(), fields));
        Ok(())
    }

    async fn recently_done(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == JobStatus::Done)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn pending_notifications(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.pr_merged && j.should_email_user && !j.user_emailed)
            .take(limit)
            .cloned()
            .collect())
    }
}

// ── Generation step ────────────────────────────────────────────────

/// Generation step that returns a scripted transcript (or a scripted
/// failure) and records the inputs it was called with.
pub struct FakeGenerator {
    output: Result<String, String>,
    calls: Mutex<Vec<GeneratorInput>>,
}

impl FakeGenerator {
    pub fn succeeding(output: &str) -> Self {
        Self {
            output: Ok(output.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            output: Err(error.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<GeneratorInput> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GeneratorStep for FakeGenerator {
    async fn run(&self, input: &GeneratorInput) -> Result<String> {
        self.calls.lock().unwrap().push(input.clone());
        match &self.output {
            Ok(output) => Ok(output.clone()),
            Err(error) => anyhow::bail!("{}", error),
        }
    }
}

// ── Mail ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Mailer that records sends, or refuses every send when built with
/// `failing()`.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
    fail: bool,
}

impl RecordingMailer {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        if self.fail {
            return Err(MailError::Transport("relay refused".to_string()));
        }
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

// ── Hosting API ────────────────────────────────────────────────────

/// Pull-request read side that answers every lookup with one fixed snapshot.
pub struct StaticPulls {
    snapshot: PullSnapshot,
}

impl StaticPulls {
    pub fn new(snapshot: PullSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl PullSource for StaticPulls {
    async fn pull_snapshot(&self, _pr: &crate::models::PullRequestRef) -> Result<PullSnapshot> {
        Ok(self.snapshot.clone())
    }
}

/// In-memory repository. Branches hold independent file sets; a branch
/// created from a sha starts empty, so reads fall back to the base branch
/// exactly as the patch path expects.
pub struct MemoryRepoHost {
    default_branch: String,
    branches: Mutex<HashMap<String, String>>,
    files: Mutex<HashMap<(String, String), RepoFile>>,
    commits: Mutex<Vec<String>>,
    pulls: Mutex<Vec<(String, String, String)>>,
    sha_counter: AtomicU64,
}

impl MemoryRepoHost {
    pub fn new(default_branch: &str) -> Self {
        let host = Self {
            default_branch: default_branch.to_string(),
            branches: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            commits: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
            sha_counter: AtomicU64::new(1),
        };
        host.branches
            .lock()
            .unwrap()
            .insert(default_branch.to_string(), "root-sha".to_string());
        host
    }

    fn next_sha(&self) -> String {
        format!("sha-{}", self.sha_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Seed a file on a branch directly, without recording a commit.
    pub fn seed_file(&self, branch: &str, path: &str, content: &str) {
        let sha = self.next_sha();
        self.files.lock().unwrap().insert(
            (branch.to_string(), path.to_string()),
            RepoFile {
                content: content.to_string(),
                sha,
            },
        );
    }

    pub fn file(&self, branch: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&(branch.to_string(), path.to_string()))
            .map(|f| f.content.clone())
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.branches.lock().unwrap().contains_key(branch)
    }

    /// Commit messages in order.
    pub fn commits(&self) -> Vec<String> {
        self.commits.lock().unwrap().clone()
    }

    /// `(title, head, base)` for every opened pull request.
    pub fn pulls(&self) -> Vec<(String, String, String)> {
        self.pulls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RepoHost for MemoryRepoHost {
    async fn default_branch(&self, _owner_repo: &str) -> Result<String> {
        Ok(self.default_branch.clone())
    }

    async fn branch_sha(&self, _owner_repo: &str, branch: &str) -> Result<Option<String>> {
        Ok(self.branches.lock().unwrap().get(branch).cloned())
    }

    async fn create_branch(&self, _owner_repo: &str, branch: &str, sha: &str) -> Result<()> {
        self.branches
            .lock()
            .unwrap()
            .insert(branch.to_string(), sha.to_string());
        Ok(())
    }

    async fn file_contents(
        &self,
        _owner_repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<RepoFile>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(&(git_ref.to_string(), path.to_string()))
            .cloned())
    }

    async fn put_file(
        &self,
        _owner_repo: &str,
        path: &str,
        branch: &str,
        message: &str,
        content: &str,
        _sha: Option<&str>,
    ) -> Result<()> {
        if !self.branches.lock().unwrap().contains_key(branch) {
            anyhow::bail!("branch {} does not exist", branch);
        }
        let sha = self.next_sha();
        self.files.lock().unwrap().insert(
            (branch.to_string(), path.to_string()),
            RepoFile {
                content: content.to_string(),
                sha,
            },
        );
        self.commits.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn create_pull(
        &self,
        owner_repo: &str,
        title: &str,
        _body: &str,
        head: &str,
        base: &str,
    ) -> Result<String> {
        let mut pulls = self.pulls.lock().unwrap();
        pulls.push((title.to_string(), head.to_string(), base.to_string()));
        Ok(format!(
            "https://github.com/{}/pull/{}",
            owner_repo,
            pulls.len()
        ))
    }
}
