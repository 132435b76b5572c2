//! Merge detection and notification: reconciles local job state against the
//! externally-observed pull-request-merged fact, and sends at most one email
//! per opted-in job.
//!
//! Both passes are safe to run repeatedly and concurrently with other
//! workers: each acts on one row at a time through single atomic updates,
//! and `user_emailed` is the sole dedup authority for sends.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::github::{PullSnapshot, PullSource};
use crate::mail::Mailer;
use crate::models::{Job, MergeUpdate, NotifiedUpdate, PullRequestRef, truncate_with_ellipsis};
use crate::queue::JobQueue;

const SWEEP_LIMIT: usize = 100;
const SUMMARY_DISPLAY_LIMIT: usize = 80;

pub struct Reconciler {
    queue: Arc<dyn JobQueue>,
    pulls: Arc<dyn PullSource>,
    mailer: Option<Arc<dyn Mailer>>,
}

impl Reconciler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pulls: Arc<dyn PullSource>,
        mailer: Option<Arc<dyn Mailer>>,
    ) -> Self {
        Self {
            queue,
            pulls,
            mailer,
        }
    }

    /// Run both reconciliation passes. Never propagates errors: one row's
    /// failure is logged and must not block the rest of the sweep.
    pub async fn run_passes(&self) {
        self.check_merges().await;
        self.send_pending().await;
    }

    /// Merge-check pass: poll recently completed jobs for merged pull
    /// requests, recording merge state and attempting the opted-in
    /// notification in a single update per row.
    async fn check_merges(&self) {
        let rows = match self.queue.recently_done(SWEEP_LIMIT).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "merge-check sweep failed to fetch completed jobs");
                return;
            }
        };
        let rows: Vec<Job> = rows
            .into_iter()
            .filter(|job| job.pr_url.is_some() && !job.pr_merged)
            .collect();
        debug!(count = rows.len(), "merge-check candidates");

        for job in rows {
            let Some(pr_url) = job.pr_url.clone() else {
                continue;
            };
            let Some(pr) = PullRequestRef::parse(&pr_url) else {
                warn!(job_id = %job.id, pr_url = %pr_url, "could not parse PR URL");
                continue;
            };

            let snapshot = match self.pulls.pull_snapshot(&pr).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(job_id = %job.id, pr = %pr, error = %e, "merge check failed");
                    continue;
                }
            };
            if !snapshot.merged {
                debug!(pr = %pr, "pull request not merged yet");
                continue;
            }

            let merged_at = snapshot.merged_at.unwrap_or_else(Utc::now);
            let mut user_emailed = None;
            if job.should_email_user && !job.user_emailed && !job.requester_email().is_empty() {
                if self.try_notify(&job, &pr_url, &snapshot).await {
                    user_emailed = Some(true);
                }
            }

            let update = MergeUpdate {
                pr_merged: true,
                merged_at,
                user_emailed,
            };
            match serde_json::to_value(&update) {
                Ok(fields) => {
                    if let Err(e) = self.queue.update(&job.id, fields).await {
                        error!(job_id = %job.id, error = %e, "failed to record merge state");
                        continue;
                    }
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to encode merge update");
                    continue;
                }
            }
            info!(job_id = %job.id, pr = %pr, %merged_at, "recorded merged pull request");
        }
    }

    /// Pending-notification pass: retry sends for rows already marked merged
    /// where the user opted in but no send has been confirmed yet.
    async fn send_pending(&self) {
        let rows = match self.queue.pending_notifications(SWEEP_LIMIT).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "pending-notification sweep failed to fetch rows");
                return;
            }
        };
        debug!(count = rows.len(), "pending notifications");

        for job in rows {
            let email = job.requester_email();
            let Some(pr_url) = job.pr_url.clone() else {
                continue;
            };
            if email.is_empty() {
                continue;
            }

            // Degrade to an empty snapshot when the hosting API is
            // unavailable; the notification still carries the PR link.
            let snapshot = match PullRequestRef::parse(&pr_url) {
                Some(pr) => self.pulls.pull_snapshot(&pr).await.unwrap_or_default(),
                None => PullSnapshot::default(),
            };

            if self.try_notify(&job, &pr_url, &snapshot).await {
                let update = NotifiedUpdate { user_emailed: true };
                match serde_json::to_value(&update) {
                    Ok(fields) => {
                        if let Err(e) = self.queue.update(&job.id, fields).await {
                            error!(job_id = %job.id, error = %e, "failed to mark job as emailed");
                        } else {
                            info!(job_id = %job.id, "marked job as emailed");
                        }
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "failed to encode emailed update")
                    }
                }
            }
        }
    }

    /// Compose and attempt one notification send. Returns true only on a
    /// confirmed send; false covers both transport failure and the
    /// no-mailer-configured skip.
    async fn try_notify(&self, job: &Job, pr_url: &str, snapshot: &PullSnapshot) -> bool {
        let Some(mailer) = &self.mailer else {
            info!(job_id = %job.id, "SMTP not configured; skipping notification");
            return false;
        };
        let (subject, body) = compose_notification(job, pr_url, snapshot);
        match mailer.send(job.requester_email(), &subject, &body).await {
            Ok(()) => {
                info!(job_id = %job.id, to = %job.requester_email(), "notification sent");
                true
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "notification send failed");
                false
            }
        }
    }
}

/// Build the notification subject and plain-text body from the job row and
/// the observed pull-request state. Unavailable sections are omitted.
pub fn compose_notification(job: &Job, pr_url: &str, snapshot: &PullSnapshot) -> (String, String) {
    let name = match job.requester_name() {
        "" => "there",
        name => name,
    };
    let message = job.message_text();

    let fallback_summary = if message.is_empty() {
        "Your request was implemented".to_string()
    } else {
        truncate_with_ellipsis(message, SUMMARY_DISPLAY_LIMIT)
    };
    let summary = snapshot.title.clone().unwrap_or(fallback_summary);
    let subject = format!("Feature request merged: {}", summary);

    let mut lines = vec![
        format!("Hi {},", name),
        String::new(),
        "Your requested change has been merged and is live.".to_string(),
        String::new(),
        format!("Summary: {}", summary),
        String::new(),
    ];

    if !message.is_empty() {
        lines.push(format!("Request: {}", message));
    }
    lines.push(format!("Pull Request: {}", pr_url));

    let has_stats = snapshot.additions.is_some() || snapshot.deletions.is_some();
    if !snapshot.files.is_empty() || has_stats {
        lines.push(String::new());
        lines.push("What changed:".to_string());
        for file in &snapshot.files {
            lines.push(format!("- {}", file));
        }
        if has_stats {
            lines.push(format!(
                "- Diff stats: +{} / -{}",
                snapshot.additions.unwrap_or(0),
                snapshot.deletions.unwrap_or(0)
            ));
        }
    }

    if let Some(excerpt) = snapshot.body.as_deref().and_then(body_excerpt) {
        lines.push(String::new());
        lines.push("Details:".to_string());
        lines.push(excerpt);
    }

    lines.push(String::new());
    lines.push("Thank you for helping improve the project!".to_string());

    (subject, lines.join("\n"))
}

/// The pull-request body's leading paragraph: text up to the first blank
/// line after content begins.
fn body_excerpt(body: &str) -> Option<String> {
    let mut excerpt: Vec<&str> = Vec::new();
    for line in body.lines() {
        if line.trim().is_empty() && !excerpt.is_empty() {
            break;
        }
        excerpt.push(line);
    }
    let text = excerpt.join("\n").trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingMailer, StaticPulls, job_fixture, memory_queue_with};
    use chrono::TimeZone;

    fn merged_snapshot() -> PullSnapshot {
        PullSnapshot {
            merged: true,
            merged_at: Some(Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()),
            title: Some("Update navbar CTA label".to_string()),
            body: Some("Rename the CTA.\n\nExtra detail that is cut.".to_string()),
            additions: Some(3),
            deletions: Some(1),
            files: vec!["src/navbar.tsx".to_string()],
        }
    }

    fn done_job(id: &str, opted_in: bool) -> Job {
        let mut job = job_fixture(id);
        job.status = crate::models::JobStatus::Done;
        job.pr_url = Some("https://github.com/acme/site/pull/7".to_string());
        job.should_email_user = opted_in;
        job.email = Some("u@x.com".to_string());
        job.message = Some("Update navbar CTA label".to_string());
        job
    }

    #[tokio::test]
    async fn test_merge_check_records_merge_and_sends_once() {
        let queue = memory_queue_with(vec![done_job("j1", true)]);
        let mailer = Arc::new(RecordingMailer::default());
        let reconciler = Reconciler::new(
            queue.clone(),
            Arc::new(StaticPulls::new(merged_snapshot())),
            Some(mailer.clone()),
        );

        reconciler.run_passes().await;

        let job = queue.get("j1").unwrap();
        assert!(job.pr_merged);
        assert!(job.user_emailed);
        assert!(job.merged_at.is_some());
        assert_eq!(mailer.sent().len(), 1);
        assert!(mailer.sent()[0].subject.contains("Update navbar CTA label"));

        // A repeated pass observes the same merged row but sends nothing.
        reconciler.run_passes().await;
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_opted_out_row_is_never_emailed() {
        let queue = memory_queue_with(vec![done_job("j1", false)]);
        let mailer = Arc::new(RecordingMailer::default());
        let reconciler = Reconciler::new(
            queue.clone(),
            Arc::new(StaticPulls::new(merged_snapshot())),
            Some(mailer.clone()),
        );

        reconciler.run_passes().await;
        reconciler.run_passes().await;

        let job = queue.get("j1").unwrap();
        assert!(job.pr_merged);
        assert!(!job.user_emailed);
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unmerged_pull_leaves_row_untouched() {
        let queue = memory_queue_with(vec![done_job("j1", true)]);
        let mailer = Arc::new(RecordingMailer::default());
        let reconciler = Reconciler::new(
            queue.clone(),
            Arc::new(StaticPulls::new(PullSnapshot::default())),
            Some(mailer.clone()),
        );

        reconciler.run_passes().await;

        let job = queue.get("j1").unwrap();
        assert!(!job.pr_merged);
        assert!(!job.user_emailed);
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_merge_recorded_even_when_send_fails() {
        let queue = memory_queue_with(vec![done_job("j1", true)]);
        let mailer = Arc::new(RecordingMailer::failing());
        let reconciler = Reconciler::new(
            queue.clone(),
            Arc::new(StaticPulls::new(merged_snapshot())),
            Some(mailer.clone()),
        );

        reconciler.run_passes().await;

        let job = queue.get("j1").unwrap();
        assert!(job.pr_merged, "merge state must not be blocked by mail failure");
        assert!(!job.user_emailed);
    }

    #[tokio::test]
    async fn test_pending_pass_retries_until_send_succeeds() {
        let mut job = done_job("j1", true);
        job.pr_merged = true;
        job.merged_at = Some(Utc::now());
        let queue = memory_queue_with(vec![job]);

        let failing = Arc::new(RecordingMailer::failing());
        let reconciler = Reconciler::new(
            queue.clone(),
            Arc::new(StaticPulls::new(merged_snapshot())),
            Some(failing.clone()),
        );
        reconciler.run_passes().await;
        assert!(!queue.get("j1").unwrap().user_emailed);

        let working = Arc::new(RecordingMailer::default());
        let reconciler = Reconciler::new(
            queue.clone(),
            Arc::new(StaticPulls::new(merged_snapshot())),
            Some(working.clone()),
        );
        reconciler.run_passes().await;
        assert!(queue.get("j1").unwrap().user_emailed);
        assert_eq!(working.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_no_mailer_means_skip_not_failure() {
        let queue = memory_queue_with(vec![done_job("j1", true)]);
        let reconciler = Reconciler::new(
            queue.clone(),
            Arc::new(StaticPulls::new(merged_snapshot())),
            None,
        );

        reconciler.run_passes().await;

        let job = queue.get("j1").unwrap();
        assert!(job.pr_merged);
        assert!(!job.user_emailed, "skip must leave the dedup flag false");
    }

    #[test]
    fn test_compose_notification_full_body() {
        let job = done_job("j1", true);
        let (subject, body) =
            compose_notification(&job, "https://github.com/acme/site/pull/7", &merged_snapshot());
        assert_eq!(subject, "Feature request merged: Update navbar CTA label");
        assert!(body.contains("Hi there,"));
        assert!(body.contains("Request: Update navbar CTA label"));
        assert!(body.contains("Pull Request: https://github.com/acme/site/pull/7"));
        assert!(body.contains("- src/navbar.tsx"));
        assert!(body.contains("- Diff stats: +3 / -1"));
        assert!(body.contains("Details:\nRename the CTA."));
        assert!(!body.contains("Extra detail"));
    }

    #[test]
    fn test_compose_notification_degrades_gracefully() {
        let mut job = done_job("j1", true);
        job.message = None;
        job.name = Some("Ada".to_string());
        let (subject, body) = compose_notification(
            &job,
            "https://github.com/acme/site/pull/7",
            &PullSnapshot::default(),
        );
        assert_eq!(subject, "Feature request merged: Your request was implemented");
        assert!(body.contains("Hi Ada,"));
        assert!(!body.contains("What changed:"));
        assert!(!body.contains("Details:"));
    }

    #[test]
    fn test_body_excerpt_stops_at_first_blank_line() {
        assert_eq!(
            body_excerpt("First line.\nSecond line.\n\nRest."),
            Some("First line.\nSecond line.".to_string())
        );
        assert_eq!(body_excerpt("\n\nLeading blanks.\n\nRest."), Some("Leading blanks.".to_string()));
        assert_eq!(body_excerpt("   \n  "), None);
    }
}
