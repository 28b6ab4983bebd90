//! Branch Resolution Chain.
//!
//! Picks the branch the primary pipeline deploys from, once, at bootstrap:
//!
//! 1. bypass flag set → configured fallback, no remote call;
//! 2. otherwise the provider's default branch, authenticated when a token is
//!    configured.
//!
//! Every remote failure halts bootstrap with a typed error. The chain never
//! falls back silently: deploying the wrong branch is worse than not
//! deploying.

use std::sync::Arc;
use std::time::Duration;

use domain::{
    BranchName, ControllerError, MetadataError, RepositoryId, RepositoryMetadata,
    ResolutionResult, ResolutionSource, SecretError, SecretName, SecretStore, SecretString,
};
use tracing::{info, instrument, warn};

/// Warning attached when the bypass flag short-circuits the chain.
pub const WARNING_VALIDATION_SKIPPED: &str =
    "branch validation skipped; using configured fallback branch";

/// Warning attached when the metadata request was made without a token.
pub const WARNING_ANONYMOUS: &str =
    "no API token configured; repository metadata requested anonymously";

const RATE_LIMIT_GUIDANCE: &str =
    "repository metadata API rate limit exceeded; configure an API token to raise the limit";

/// The "skip validation" switch.
///
/// The environment override, when present, wins over the configured value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BypassFlag {
    pub configured: bool,
    pub env_override: Option<bool>,
}

impl BypassFlag {
    pub fn is_set(self) -> bool {
        self.env_override.unwrap_or(self.configured)
    }

    /// Parses a boolean environment value (`true`/`false`, `1`/`0`,
    /// `yes`/`no`, `on`/`off`, case-insensitive).
    pub fn parse_env(value: &str) -> Option<bool> {
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" | "" => Some(false),
            _ => None,
        }
    }
}

/// Credential and fallback settings for one resolution.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Secret holding the API token; anonymous when `None`.
    pub token_secret: Option<SecretName>,
    /// Fail instead of making an anonymous request.
    pub token_required: bool,
    /// Branch used when the bypass flag is set.
    pub fallback_branch: BranchName,
    pub bypass: BypassFlag,
}

/// Runs the resolution chain against a metadata provider and secret store.
pub struct BranchResolver {
    metadata: Arc<dyn RepositoryMetadata>,
    secrets: Arc<dyn SecretStore>,
    timeout: Duration,
}

impl std::fmt::Debug for BranchResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchResolver")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl BranchResolver {
    pub fn new(
        metadata: Arc<dyn RepositoryMetadata>,
        secrets: Arc<dyn SecretStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            metadata,
            secrets,
            timeout,
        }
    }

    /// Resolves the primary branch of `repository`.
    #[instrument(skip_all, fields(repository = %repository))]
    pub async fn resolve_branch(
        &self,
        repository: &RepositoryId,
        config: &CredentialConfig,
    ) -> Result<ResolutionResult, ControllerError> {
        if config.bypass.is_set() {
            warn!(branch = %config.fallback_branch, "Branch validation skipped");
            return Ok(ResolutionResult {
                branch: config.fallback_branch.clone(),
                source: ResolutionSource::Fallback,
                warnings: vec![WARNING_VALIDATION_SKIPPED.to_string()],
            });
        }

        let mut warnings = Vec::new();
        let token = self.token(config).await?;
        if token.is_none() {
            warn!("Requesting repository metadata anonymously");
            warnings.push(WARNING_ANONYMOUS.to_string());
        }

        let lookup = self.metadata.default_branch(repository, token.as_ref());
        let reported = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(branch)) => branch,
            Ok(Err(e)) => return Err(classify(repository, e)),
            Err(_) => {
                return Err(ControllerError::transient(
                    "default_branch",
                    format!("no response within {:?}", self.timeout),
                ))
            }
        };

        let branch = BranchName::parse(reported)?;
        info!(%branch, "Resolved default branch");
        Ok(ResolutionResult {
            branch,
            source: ResolutionSource::RemoteAPI,
            warnings,
        })
    }

    async fn token(&self, config: &CredentialConfig) -> Result<Option<SecretString>, ControllerError> {
        let Some(name) = &config.token_secret else {
            if config.token_required {
                return Err(ControllerError::Authentication {
                    reason: "an API token is required but none is configured".to_string(),
                });
            }
            return Ok(None);
        };

        match self.secrets.get_secret(name).await {
            Ok(token) => Ok(Some(token)),
            Err(e @ (SecretError::NotFound { .. } | SecretError::AccessDenied { .. })) => {
                Err(ControllerError::Authentication {
                    reason: format!("API token unavailable: {e}"),
                })
            }
            Err(e @ SecretError::Unavailable { .. }) => {
                Err(ControllerError::transient("get_secret", e.to_string()))
            }
        }
    }
}

/// Maps a metadata failure onto the boundary taxonomy.
fn classify(repository: &RepositoryId, err: MetadataError) -> ControllerError {
    match err {
        MetadataError::Unauthorized { status, message } => ControllerError::Authentication {
            reason: format!("repository metadata request rejected (HTTP {status}): {message}"),
        },
        MetadataError::RateLimited { retry_after, .. } => ControllerError::RateLimited {
            guidance: RATE_LIMIT_GUIDANCE.to_string(),
            retry_after,
        },
        MetadataError::NotFound => ControllerError::NotFound {
            resource: format!("repository {repository}"),
        },
        MetadataError::Transient { message } => {
            ControllerError::transient("default_branch", message)
        }
        other @ MetadataError::Other { .. } => {
            ControllerError::fatal("default_branch", other.to_string())
        }
    }
}

#[cfg(test)]
#[path = "resolution_tests.rs"]
mod tests;
