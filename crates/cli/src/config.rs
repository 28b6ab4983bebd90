//! Layered configuration.
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. the TOML file (`--config`, default `branchfleet.toml`, optional)
//! 3. `BRANCHFLEET__<SECTION>__<KEY>` environment variables
//! 4. the flat `SKIP_BRANCH_VALIDATION` variable, for the bypass flag only
//!
//! [`Settings::validate`] runs before anything is constructed from the
//! result, so the binary never starts with a configuration it cannot use.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use backend::SqsSettings;
use config::{Config, Environment, File, FileFormat};
use controller::{BusSettings, BypassFlag, CredentialConfig, LifecycleSettings};
use domain::{BranchName, RepositoryId, SecretName, TemplateRef};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "branchfleet.toml";
pub const ENV_PREFIX: &str = "BRANCHFLEET";
pub const LEGACY_BYPASS_VAR: &str = "SKIP_BRANCH_VALIDATION";

/// SQS limits on long polling and message visibility.
const MAX_WAIT_TIME_SECS: u64 = 20;
const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;

/// Bounded calls a handler makes outside its settle windows, with one spare
/// for a poll that overruns the window.
const HANDLER_CALL_BUDGET: u64 = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub repository: RepositorySettings,
    pub server: ServerSettings,
    pub secrets: SecretsSettings,
    pub resolution: ResolutionSettings,
    pub github: GithubApiSettings,
    pub lifecycle: LifecycleConfig,
    pub backend: BackendSettings,
    pub bus: BusConfig,
    pub telemetry: TelemetrySettings,

    /// Value of [`LEGACY_BYPASS_VAR`], when set.
    #[serde(skip)]
    pub legacy_bypass: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositorySettings {
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub bind: String,
    pub webhook_path: String,
    pub body_limit_bytes: usize,
    /// Base URL operators reach the running instance on, e.g.
    /// `https://branchfleet.internal`. Derived from `bind` when unset.
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretBackendKind {
    /// `BRANCHFLEET_SECRET_<NAME>` environment variables.
    Env,
    /// AWS Secrets Manager through the `aws` CLI.
    AwsCli,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsSettings {
    pub backend: SecretBackendKind,
    pub webhook_secret: String,
    /// Secret holding the metadata API token; anonymous access when unset.
    pub api_token: Option<String>,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolutionSettings {
    pub fallback_branch: String,
    pub skip_validation: bool,
    pub token_required: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubApiSettings {
    pub api_base: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    pub template: String,
    pub call_timeout_secs: u64,
    pub settle_poll_interval_secs: u64,
    pub settle_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Process-local state; for development and demos.
    Memory,
    /// CodeBuild, CloudFormation and S3 through the `aws` CLI.
    AwsCli,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub program: String,
    pub region: Option<String>,
    pub project_prefix: String,
    pub stack_prefix: String,
    #[serde(default)]
    pub stage_stacks: Vec<String>,
    pub artifact_bucket: String,
    pub source_location: String,
    pub service_role: String,
    pub build_image: String,
    pub compute_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusKind {
    /// Bounded channel in process memory. Queued events are lost on exit;
    /// development only.
    InProcess,
    /// SQS queue through the `aws` CLI.
    Sqs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    pub kind: BusKind,
    pub capacity: usize,
    pub max_concurrent_handlers: usize,
    /// Zero disables delivery de-duplication.
    pub dedup_window_secs: u64,
    pub dedup_capacity: usize,
    pub queue_url: Option<String>,
    pub wait_time_secs: u64,
    pub max_messages: u8,
    pub visibility_timeout_secs: u64,
    /// Deliveries a queued event gets before a retryable failure is final.
    pub max_receive_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

impl Settings {
    /// Loads settings from `path` (or [`DEFAULT_CONFIG_FILE`]) and the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let legacy = std::env::var(LEGACY_BYPASS_VAR).ok();
        Self::from_sources(path, None, legacy.as_deref())
    }

    /// Loads settings from explicit sources.
    ///
    /// `env` replaces the process environment when given. An explicit
    /// `path` must exist; the default file is optional.
    pub fn from_sources(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
        legacy_bypass: Option<&str>,
    ) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (p.to_string_lossy().into_owned(), true),
            None => (DEFAULT_CONFIG_FILE.to_string(), false),
        };

        let built = Config::builder()
            .set_default("server.bind", "0.0.0.0:8080")?
            .set_default("server.webhook_path", "/webhook")?
            .set_default("server.body_limit_bytes", 25 * 1024 * 1024)?
            .set_default("secrets.backend", "env")?
            .set_default("secrets.webhook_secret", "github-webhook-secret")?
            .set_default("secrets.cache_ttl_secs", 300)?
            .set_default("resolution.fallback_branch", "main")?
            .set_default("resolution.skip_validation", false)?
            .set_default("resolution.token_required", false)?
            .set_default("resolution.timeout_secs", 10)?
            .set_default("github.api_base", github::client::DEFAULT_API_BASE)?
            .set_default("github.user_agent", concat!("branchfleet/", env!("CARGO_PKG_VERSION")))?
            .set_default("lifecycle.call_timeout_secs", 60)?
            .set_default("lifecycle.settle_poll_interval_secs", 15)?
            .set_default("lifecycle.settle_timeout_secs", 1800)?
            .set_default("backend.kind", "memory")?
            .set_default("backend.program", "aws")?
            .set_default("backend.project_prefix", "branchfleet")?
            .set_default("backend.stack_prefix", "cdk-pipelines-multi-branch")?
            .set_default("backend.artifact_bucket", "")?
            .set_default("backend.source_location", "")?
            .set_default("backend.service_role", "")?
            .set_default("backend.build_image", "aws/codebuild/standard:7.0")?
            .set_default("backend.compute_type", "BUILD_GENERAL1_SMALL")?
            .set_default("bus.kind", "in-process")?
            .set_default("bus.capacity", 256)?
            .set_default("bus.max_concurrent_handlers", 32)?
            .set_default("bus.dedup_window_secs", 3600)?
            .set_default("bus.dedup_capacity", 10_000)?
            .set_default("bus.wait_time_secs", 20)?
            .set_default("bus.max_messages", 10)?
            .set_default("bus.visibility_timeout_secs", 3900)?
            .set_default("bus.max_receive_count", 5)?
            .set_default("telemetry.log_level", "info")?
            .set_default("telemetry.service_name", "branchfleet")?
            .add_source(File::new(&file, FileFormat::Toml).required(required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .with_context(|| format!("Failed to load configuration from '{file}'"))?;

        let mut settings: Settings = built
            .try_deserialize()
            .context("Configuration is incomplete or has the wrong shape")?;

        settings.legacy_bypass = match legacy_bypass {
            Some(raw) => Some(BypassFlag::parse_env(raw).with_context(|| {
                format!("{LEGACY_BYPASS_VAR}={raw:?} is not a boolean")
            })?),
            None => None,
        };
        Ok(settings)
    }

    /// Checks every value that has to parse into a domain type.
    pub fn validate(&self) -> Result<()> {
        self.repository()?;
        self.credentials()?;
        self.lifecycle()?;
        self.webhook_secret()?;
        if self.resolution.timeout_secs == 0 {
            bail!("resolution.timeout_secs must be greater than zero");
        }
        if self.server.body_limit_bytes == 0 {
            bail!("server.body_limit_bytes must be greater than zero");
        }
        if !self.server.webhook_path.starts_with('/') {
            bail!(
                "server.webhook_path {:?} must start with '/'",
                self.server.webhook_path
            );
        }
        if self.backend.kind == BackendKind::AwsCli && self.backend.artifact_bucket.is_empty() {
            bail!("backend.artifact_bucket is required for the aws-cli backend");
        }
        if self.backend.kind == BackendKind::AwsCli && self.bus.kind == BusKind::InProcess {
            bail!("the aws-cli backend needs a durable event queue; set bus.kind = \"sqs\"");
        }
        if self.bus.kind == BusKind::Sqs {
            self.sqs()?;
        }
        Ok(())
    }

    pub fn repository(&self) -> Result<RepositoryId> {
        let full_name = format!("{}/{}", self.repository.owner, self.repository.name);
        RepositoryId::parse(&full_name)
            .context("repository.owner and repository.name must both be set")
    }

    pub fn webhook_secret(&self) -> Result<SecretName> {
        SecretName::new(self.secrets.webhook_secret.as_str())
            .context("secrets.webhook_secret must not be empty")
    }

    pub fn bypass(&self) -> BypassFlag {
        BypassFlag {
            configured: self.resolution.skip_validation,
            env_override: self.legacy_bypass,
        }
    }

    pub fn credentials(&self) -> Result<CredentialConfig> {
        let fallback_branch = BranchName::parse(self.resolution.fallback_branch.as_str())
            .with_context(|| {
                format!(
                    "resolution.fallback_branch {:?} is not a usable branch name",
                    self.resolution.fallback_branch
                )
            })?;
        let token_secret = match self.secrets.api_token.as_deref() {
            Some(name) => {
                Some(SecretName::new(name).context("secrets.api_token must not be empty")?)
            }
            None => None,
        };
        Ok(CredentialConfig {
            token_secret,
            token_required: self.resolution.token_required,
            fallback_branch,
            bypass: self.bypass(),
        })
    }

    pub fn lifecycle(&self) -> Result<LifecycleSettings> {
        let l = &self.lifecycle;
        let template = TemplateRef::new(l.template.as_str())
            .context("lifecycle.template must name the pipeline template")?;
        for (key, value) in [
            ("lifecycle.call_timeout_secs", l.call_timeout_secs),
            ("lifecycle.settle_poll_interval_secs", l.settle_poll_interval_secs),
            ("lifecycle.settle_timeout_secs", l.settle_timeout_secs),
        ] {
            if value == 0 {
                bail!("{key} must be greater than zero");
            }
        }
        let mut settings = LifecycleSettings::new(template);
        settings.call_timeout = Duration::from_secs(l.call_timeout_secs);
        settings.settle_poll_interval = Duration::from_secs(l.settle_poll_interval_secs);
        settings.settle_timeout = Duration::from_secs(l.settle_timeout_secs);
        Ok(settings)
    }

    pub fn bus(&self) -> BusSettings {
        BusSettings {
            capacity: self.bus.capacity,
            max_concurrent_handlers: self.bus.max_concurrent_handlers,
        }
    }

    /// Queue settings for `bus.kind = "sqs"`.
    pub fn sqs(&self) -> Result<SqsSettings> {
        let b = &self.bus;
        let queue_url = match b.queue_url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => bail!("bus.queue_url is required for the sqs bus"),
        };
        // Only a FIFO queue keeps one branch's events in order across
        // several consuming instances.
        if !queue_url.ends_with(".fifo") {
            bail!("bus.queue_url {queue_url:?} must name a FIFO queue (ending in \".fifo\")");
        }
        if b.max_receive_count == 0 {
            bail!("bus.max_receive_count must be greater than zero");
        }
        if b.wait_time_secs > MAX_WAIT_TIME_SECS {
            bail!("bus.wait_time_secs must be at most {MAX_WAIT_TIME_SECS}");
        }
        if !(1..=backend::sqs::MAX_BATCH).contains(&b.max_messages) {
            bail!(
                "bus.max_messages must be between 1 and {}",
                backend::sqs::MAX_BATCH
            );
        }
        let longest_handler = self.longest_handler_secs();
        if b.visibility_timeout_secs <= longest_handler
            || b.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS
        {
            bail!(
                "bus.visibility_timeout_secs must exceed the longest lifecycle operation ({longest_handler}s: two settle timeouts plus {HANDLER_CALL_BUDGET} call timeouts) and be at most {MAX_VISIBILITY_TIMEOUT_SECS}"
            );
        }
        Ok(SqsSettings {
            program: self.backend.program.clone(),
            region: self.backend.region.clone(),
            queue_url,
            max_messages: b.max_messages,
            wait_time: Duration::from_secs(b.wait_time_secs),
            visibility_timeout: Duration::from_secs(b.visibility_timeout_secs),
            call_timeout: self.call_timeout(),
        })
    }

    /// Where `create-branch` and `delete-branch` deliver their events.
    pub fn reissue_url(&self) -> String {
        if let Some(base) = self.server.public_url.as_deref() {
            return format!("{}{}", base.trim_end_matches('/'), self.server.webhook_path);
        }
        // A host name binds as given; a wildcard address is reached on loopback.
        let authority = match self.server.bind.parse::<SocketAddr>() {
            Ok(bind) => {
                let host = match bind.ip() {
                    IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
                    ip => ip,
                };
                SocketAddr::new(host, bind.port()).to_string()
            }
            Err(_) => self.server.bind.clone(),
        };
        format!("http://{authority}{}", self.server.webhook_path)
    }

    /// Worst case for one lifecycle handler: waiting out an opposite
    /// operation, then its own, plus the calls around them.
    fn longest_handler_secs(&self) -> u64 {
        let l = &self.lifecycle;
        l.settle_timeout_secs
            .saturating_mul(2)
            .saturating_add(l.call_timeout_secs.saturating_mul(HANDLER_CALL_BUDGET))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.call_timeout_secs)
    }

    pub fn resolution_timeout(&self) -> Duration {
        Duration::from_secs(self.resolution.timeout_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
