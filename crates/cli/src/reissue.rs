//! Operator-issued branch events.
//!
//! `create-branch` and `delete-branch` hand their event to the running
//! instance as a signed webhook delivery. The event then takes the same
//! path as one sent by GitHub: it is queued, de-duplicated and applied under
//! the instance's per-branch claim.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use domain::{signature, BranchName, EventKind, RepositoryId, SecretString};
use listener::webhook::{DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

/// Sender login recorded on operator-issued events.
pub const OPERATOR_LOGIN: &str = "branchfleet-cli";

/// The running instance's answer to a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub status: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct ReissueClient {
    http: reqwest::Client,
    url: String,
    secret: SecretString,
    repository: RepositoryId,
}

impl std::fmt::Debug for ReissueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReissueClient")
            .field("url", &self.url)
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}

impl ReissueClient {
    pub fn new(
        url: impl Into<String>,
        secret: SecretString,
        repository: RepositoryId,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build the HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
            secret,
            repository,
        })
    }

    /// Delivers one event and returns the instance's receipt.
    ///
    /// Fails unless the instance accepted the event for processing.
    pub async fn send(&self, kind: EventKind, branch: &BranchName) -> Result<Receipt> {
        let event = match kind {
            EventKind::Created => "create",
            EventKind::Deleted => "delete",
        };
        let body = serde_json::to_vec(&json!({
            "ref": branch.as_str(),
            "ref_type": "branch",
            "repository": { "full_name": self.repository.to_string() },
            "sender": { "login": OPERATOR_LOGIN },
        }))?;
        let signature = signature::sign(&body, &self.secret)?;
        let delivery = Uuid::new_v4().to_string();

        info!(url = %self.url, %kind, %branch, %delivery, "Sending branch event to the running instance");
        let response = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, event)
            .header(DELIVERY_HEADER, &delivery)
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Could not reach the running instance at {}", self.url))?;

        let status = response.status();
        let receipt: Receipt = response
            .json()
            .await
            .with_context(|| format!("Unexpected response from {} (HTTP {status})", self.url))?;
        if !status.is_success() || receipt.status != "accepted" {
            bail!(
                "The running instance did not accept the event (HTTP {status}, status '{}', reason {}, trace id {})",
                receipt.status,
                receipt.reason.as_deref().unwrap_or("none"),
                receipt.trace_id
            );
        }
        Ok(receipt)
    }
}

#[cfg(test)]
#[path = "reissue_tests.rs"]
mod tests;
