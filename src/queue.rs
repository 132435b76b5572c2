//! The shared job queue: the claim/update/sweep contract the worker relies
//! on, and its PostgREST-backed remote implementation.
//!
//! The queue engine owns all cross-worker atomicity: `claim_next` is a single
//! stored-procedure call, and every `update` is one PATCH. Nothing here does
//! read-modify-write across calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::Value;

use crate::errors::QueueError;
use crate::models::Job;

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);
const CLAIM_PROCEDURE: &str = "claim_next_feature_request";
const JOB_TABLE: &str = "feature_requests";

/// Contract consumed by the execution envelope and the reconciler.
///
/// `claim_next` must hand a given pending row to at most one caller across
/// all workers; `update` must be atomic per call. The two sweep reads back
/// the reconciliation passes.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Atomically claim the next pending job for this worker, if any.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, QueueError>;

    /// Apply a partial update to one job row in a single atomic call.
    async fn update(&self, job_id: &str, fields: Value) -> Result<(), QueueError>;

    /// Recently completed jobs, newest first. Callers filter for rows that
    /// still need a merge check.
    async fn recently_done(&self, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// Merged, opted-in rows whose notification has not yet been confirmed.
    async fn pending_notifications(&self, limit: usize) -> Result<Vec<Job>, QueueError>;
}

/// Queue client speaking the PostgREST dialect: claims go through a stored
/// procedure under `/rest/v1/rpc/`, row updates and sweeps through the table
/// resource.
pub struct PostgrestQueue {
    http: reqwest::Client,
    base_url: String,
}

impl PostgrestQueue {
    pub fn new(base_url: &str, service_key: &str) -> Result<Self, QueueError> {
        let mut headers = HeaderMap::new();
        let mut key_value =
            HeaderValue::from_str(service_key).map_err(|_| QueueError::Status {
                status: 0,
                body: "service key contains invalid header characters".to_string(),
            })?;
        key_value.set_sensitive(true);
        headers.insert("apikey", key_value);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", service_key))
            .map_err(|_| QueueError::Status {
                status: 0,
                body: "service key contains invalid header characters".to_string(),
            })?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, JOB_TABLE)
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, QueueError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(QueueError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Normalize the claim procedure's response into at most one job row.
///
/// PostgREST may answer with null, an empty array, a one-element array, or a
/// bare object; anything without a usable `id` means "no work available".
pub fn normalize_row(value: Value) -> Result<Option<Job>, QueueError> {
    let row = match value {
        Value::Null => return Ok(None),
        Value::Array(items) => match items.into_iter().next() {
            Some(first) => first,
            None => return Ok(None),
        },
        other => other,
    };
    let Value::Object(ref fields) = row else {
        return Ok(None);
    };
    match fields.get("id") {
        None | Some(Value::Null) => return Ok(None),
        Some(_) => {}
    }
    Ok(Some(serde_json::from_value(row)?))
}

#[async_trait]
impl JobQueue for PostgrestQueue {
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, CLAIM_PROCEDURE);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "p_worker_id": worker_id }))
            .send()
            .await?;
        let value: Value = Self::checked(response).await?.json().await?;
        normalize_row(value)
    }

    async fn update(&self, job_id: &str, fields: Value) -> Result<(), QueueError> {
        let response = self
            .http
            .patch(self.table_url())
            .query(&[("id", format!("eq.{}", job_id))])
            .header("Prefer", "return=minimal")
            .json(&fields)
            .send()
            .await?;
        Self::checked(response).await?;
        Ok(())
    }

    async fn recently_done(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let response = self
            .http
            .get(self.table_url())
            .query(&[
                ("select", "*"),
                ("status", "eq.done"),
                ("order", "created_at.desc"),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await?;
        Ok(Self::checked(response).await?.json().await?)
    }

    async fn pending_notifications(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let response = self
            .http
            .get(self.table_url())
            .query(&[
                ("select", "*"),
                ("pr_merged", "eq.true"),
                ("should_email_user", "eq.true"),
                ("user_emailed", "eq.false"),
                ("order", "created_at.desc"),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await?;
        Ok(Self::checked(response).await?.json().await?)
    }
}
