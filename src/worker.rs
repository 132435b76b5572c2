//! The execution envelope: claim one job, run the generation step, persist
//! the terminal transition, then reconcile notifications.
//!
//! The envelope guarantees that a generation failure lands the row in
//! `failed` with a recorded error rather than crashing the loop, and that
//! reconciliation passes run after every cycle, successful or not.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::json;
use tracing::{error, info, warn};

use crate::generator::GeneratorStep;
use crate::models::{CompletionUpdate, FailureUpdate, GeneratorInput, JobStatus};
use crate::notify::Reconciler;
use crate::queue::JobQueue;

static CREATED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)PR\s+created:\s*(https?://\S+)").unwrap());
static PR_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://github\.com/\S+/pull/\d+").unwrap());

/// Outcome of one poll cycle. `Idle` means no job was claimed and the loop
/// should sleep before polling again.
#[derive(Debug, PartialEq)]
pub enum Cycle {
    Processed,
    Idle,
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    generator: Arc<dyn GeneratorStep>,
    reconciler: Reconciler,
    repo_url: String,
    worker_id: String,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        generator: Arc<dyn GeneratorStep>,
        reconciler: Reconciler,
        repo_url: &str,
        worker_id: &str,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            generator,
            reconciler,
            repo_url: repo_url.to_string(),
            worker_id: worker_id.to_string(),
            poll_interval,
        }
    }

    /// Poll forever. The loop survives every per-cycle failure; only process
    /// termination stops it.
    pub async fn run(&self) {
        info!(worker_id = %self.worker_id, "worker started");
        loop {
            if self.process_one().await == Cycle::Idle {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    /// One poll cycle: claim, execute, persist, reconcile.
    pub async fn process_one(&self) -> Cycle {
        let job = match self.queue.claim_next(&self.worker_id).await {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "failed to claim next job");
                return Cycle::Idle;
            }
        };
        let Some(job) = job else {
            self.reconciler.run_passes().await;
            return Cycle::Idle;
        };

        info!(job_id = %job.id, "claimed job");
        let input = GeneratorInput::from_job(&job, &self.repo_url);

        match self.generator.run(&input).await {
            Ok(result) => {
                let pr_url = extract_pr_url(&result);
                match &pr_url {
                    Some(url) => info!(job_id = %job.id, pr_url = %url, "job completed"),
                    None => info!(job_id = %job.id, "job completed without a pull request"),
                }
                let update = CompletionUpdate {
                    status: JobStatus::Done,
                    agent_run_at: Utc::now(),
                    pr_url,
                    agent_output: json!({ "inputs": input, "result": result }),
                    error: None,
                };
                self.persist(&job.id, serde_json::to_value(&update)).await;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %format!("{e:#}"), "generation step failed");
                let update = FailureUpdate {
                    status: JobStatus::Failed,
                    agent_run_at: Utc::now(),
                    error: format!("{e:#}"),
                    retry_count: job.retry_count + 1,
                };
                self.persist(&job.id, serde_json::to_value(&update)).await;
            }
        }

        self.reconciler.run_passes().await;
        Cycle::Processed
    }

    async fn persist(&self, job_id: &str, fields: serde_json::Result<serde_json::Value>) {
        match fields {
            Ok(fields) => {
                if let Err(e) = self.queue.update(job_id, fields).await {
                    error!(job_id = %job_id, error = %e, "failed to persist job transition");
                }
            }
            Err(e) => error!(job_id = %job_id, error = %e, "failed to encode job transition"),
        }
    }
}

/// Find the pull request URL in generation-step output: prefer the explicit
/// `PR created:` line, fall back to the first GitHub pull URL anywhere in the
/// text, else `None`.
pub fn extract_pr_url(output: &str) -> Option<String> {
    if let Some(caps) = CREATED_LINE.captures(output) {
        return Some(caps[1].to_string());
    }
    PR_URL.find(output).map(|m| m.as_str().to_string())
}
