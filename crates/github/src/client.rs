//! GitHub REST client for repository metadata.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use domain::{ExposeSecret, MetadataError, RepositoryId, RepositoryMetadata, SecretString};
use reqwest::header::{HeaderMap, ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

/// Public GitHub API root.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";
const MEDIA_TYPE: &str = "application/vnd.github+json";

/// Connection settings for [`GithubClient`].
#[derive(Debug, Clone)]
pub struct GithubSettings {
    /// API root, e.g. `https://api.github.com` or a GitHub Enterprise
    /// `https://host/api/v3`.
    pub api_base: String,
    pub user_agent: String,
    /// Upper bound on one request, including reading the body.
    pub timeout: Duration,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            user_agent: concat!("branchfleet/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RepositoryResponse {
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: Option<String>,
}

/// [`RepositoryMetadata`] backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GithubClient {
    settings: GithubSettings,
    client: reqwest::Client,
}

impl GithubClient {
    pub fn new(settings: GithubSettings) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| MetadataError::Other {
                status: None,
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { settings, client })
    }

    fn repository_url(&self, repository: &RepositoryId) -> String {
        format!(
            "{}/repos/{}/{}",
            self.settings.api_base.trim_end_matches('/'),
            repository.owner(),
            repository.name()
        )
    }
}

#[async_trait]
impl RepositoryMetadata for GithubClient {
    #[instrument(skip_all, fields(repository = %repository, authenticated = token.is_some()))]
    async fn default_branch(
        &self,
        repository: &RepositoryId,
        token: Option<&SecretString>,
    ) -> Result<String, MetadataError> {
        let mut request = self
            .client
            .get(self.repository_url(repository))
            .header(ACCEPT, MEDIA_TYPE)
            .header(API_VERSION_HEADER, API_VERSION)
            .header(USER_AGENT, &self.settings.user_agent);
        if let Some(token) = token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        debug!(%status, "Repository metadata response");

        if status.is_success() {
            let body: RepositoryResponse = response.json().await.map_err(|e| {
                MetadataError::Other {
                    status: Some(status.as_u16()),
                    message: format!("invalid repository response: {e}"),
                }
            })?;
            return body.default_branch.ok_or_else(|| MetadataError::Other {
                status: Some(status.as_u16()),
                message: "repository response has no default_branch".to_string(),
            });
        }

        let headers = response.headers().clone();
        let body = response.bytes().await.unwrap_or_default();
        let message = serde_json::from_slice::<ErrorResponse>(&body)
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| String::from_utf8_lossy(&body).trim().to_string());

        let err = classify(status, &headers, message);
        warn!(%status, error = %err, "Repository metadata request failed");
        Err(err)
    }
}

fn transport_error(e: reqwest::Error) -> MetadataError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        MetadataError::Transient {
            message: e.to_string(),
        }
    } else {
        MetadataError::Other {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

/// Maps a non-success response onto [`MetadataError`].
///
/// GitHub reports primary rate limits as 403 (or 429) with
/// `x-ratelimit-remaining: 0`, and secondary rate limits as 403 with a
/// message naming the rate limit.
pub(crate) fn classify(status: StatusCode, headers: &HeaderMap, message: String) -> MetadataError {
    let remaining_zero = header_str(headers, "x-ratelimit-remaining") == Some("0");
    let mentions_rate_limit = message.to_ascii_lowercase().contains("rate limit");

    match status {
        StatusCode::TOO_MANY_REQUESTS => MetadataError::RateLimited {
            retry_after: retry_after(headers),
            message,
        },
        StatusCode::FORBIDDEN if remaining_zero || mentions_rate_limit => {
            MetadataError::RateLimited {
                retry_after: retry_after(headers),
                message,
            }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => MetadataError::Unauthorized {
            status: status.as_u16(),
            message,
        },
        StatusCode::NOT_FOUND => MetadataError::NotFound,
        s if s.is_server_error() => MetadataError::Transient {
            message: format!("HTTP {}: {message}", s.as_u16()),
        },
        s => MetadataError::Other {
            status: Some(s.as_u16()),
            message,
        },
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// `retry-after` seconds, else time until `x-ratelimit-reset`.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = header_str(headers, "retry-after").and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }
    let reset = header_str(headers, "x-ratelimit-reset")?.parse::<u64>().ok()?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(Duration::from_secs(reset.saturating_sub(now)))
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
