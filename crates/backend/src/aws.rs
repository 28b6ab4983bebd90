//! AWS CLI adapters.
//!
//! Each per-branch pipeline is backed by:
//!
//! - a CodeBuild project `<project-prefix>-<branch>-create` (the build job),
//! - a CloudFormation stack `<stack-prefix>-<branch>` deployed by that
//!   project's builds (the pipeline itself),
//! - optional stage stacks the pipeline deploys, named by patterns such as
//!   `DEV-InfraStack-{branch}`,
//! - artifacts under `s3://<artifact-bucket>/<branch>/`.
//!
//! All calls shell out to `aws` through a [`CommandRunner`] and run under a
//! per-call timeout. Error output is classified by the AWS error code it
//! names.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    BackendError, BranchName, BuildJobRef, BuildJobService, LifecycleState, SecretError,
    SecretName, SecretStore, SecretString, StackHandle, StackService, TemplateRef,
};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::command::{CommandOutput, CommandRunner};

/// Placeholder replaced by the branch name in stage stack patterns.
pub const BRANCH_PLACEHOLDER: &str = "{branch}";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Naming and environment settings for [`AwsCliBackend`].
#[derive(Debug, Clone)]
pub struct AwsCliSettings {
    /// CLI executable.
    pub program: String,
    /// Region passed as `--region`; the CLI default applies when `None`.
    pub region: Option<String>,
    /// Prefix of build project names.
    pub project_prefix: String,
    /// Prefix of per-branch pipeline stack names.
    pub stack_prefix: String,
    /// Stage stacks deployed by the pipeline, removed after the pipeline
    /// stack. `{branch}` is replaced by the branch name.
    pub stage_stacks: Vec<String>,
    /// Bucket holding build artifacts, keyed by branch.
    pub artifact_bucket: String,
    /// Clone URL of the repository the build projects check out.
    pub source_location: String,
    /// IAM role the build projects run as.
    pub service_role: String,
    /// Build container image.
    pub build_image: String,
    /// Build compute type.
    pub compute_type: String,
    /// Upper bound on every CLI call.
    pub call_timeout: Duration,
}

impl Default for AwsCliSettings {
    fn default() -> Self {
        Self {
            program: "aws".to_string(),
            region: None,
            project_prefix: "branchfleet".to_string(),
            stack_prefix: "cdk-pipelines-multi-branch".to_string(),
            stage_stacks: Vec::new(),
            artifact_bucket: String::new(),
            source_location: String::new(),
            service_role: String::new(),
            build_image: "aws/codebuild/standard:7.0".to_string(),
            compute_type: "BUILD_GENERAL1_SMALL".to_string(),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl AwsCliSettings {
    /// Build project for `branch`.
    pub fn project_name(&self, branch: &BranchName) -> String {
        format!("{}-{branch}-create", self.project_prefix)
    }

    /// Pipeline stack for `branch`.
    pub fn stack_name(&self, branch: &BranchName) -> String {
        format!("{}-{branch}", self.stack_prefix)
    }

    /// Stage stacks for `branch`, in configured order.
    pub fn stage_stack_names(&self, branch: &BranchName) -> Vec<String> {
        self.stage_stacks
            .iter()
            .map(|pattern| pattern.replace(BRANCH_PLACEHOLDER, branch.as_str()))
            .collect()
    }

    /// Artifact prefix for `branch`.
    pub fn artifact_prefix(&self, branch: &BranchName) -> String {
        format!("s3://{}/{branch}", self.artifact_bucket)
    }

    /// Buildspec stored on the project: synthesises the app.
    fn project_buildspec(&self) -> String {
        [
            "version: 0.2",
            "phases:",
            "  install:",
            "    commands:",
            "      - npm install -g aws-cdk",
            "      - pip install -r requirements.txt",
            "  build:",
            "    commands:",
            "      - cdk synth",
        ]
        .join("\n")
    }

    /// Buildspec override used to deploy the branch's pipeline stack.
    fn deploy_buildspec(&self, branch: &BranchName, template: &TemplateRef) -> String {
        let stack = self.stack_name(branch);
        [
            "version: 0.2".to_string(),
            "phases:".to_string(),
            "  install:".to_string(),
            "    commands:".to_string(),
            "      - npm install -g aws-cdk".to_string(),
            "      - pip install -r requirements.txt".to_string(),
            "  build:".to_string(),
            "    commands:".to_string(),
            format!("      - cdk deploy {stack} --app \"{template}\" --require-approval never"),
        ]
        .join("\n")
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Maps CLI error output to a [`BackendError`].
pub fn classify_error(stderr: &str) -> BackendError {
    let message = first_line(stderr);
    if stderr.contains("ResourceAlreadyExistsException") || stderr.contains("AlreadyExists") {
        BackendError::AlreadyExists { resource: message }
    } else if stderr.contains("ResourceNotFoundException")
        || stderr.contains("does not exist")
        || stderr.contains("NoSuchBucket")
    {
        BackendError::NotFound { resource: message }
    } else if stderr.contains("ThrottlingException")
        || stderr.contains("Rate exceeded")
        || stderr.contains("RequestLimitExceeded")
        || stderr.contains("ServiceUnavailable")
        || stderr.contains("Could not connect to the endpoint URL")
        || stderr.contains("Connect timeout")
    {
        BackendError::Transient { message }
    } else if stderr.contains("OperationInProgressException")
        || (stderr.contains("is in ") && stderr.contains("_IN_PROGRESS state"))
    {
        BackendError::Conflict { message }
    } else {
        BackendError::Fatal { message }
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no error output")
        .to_string()
}

/// Maps a CloudFormation stack status to a [`LifecycleState`].
pub fn map_stack_status(status: &str) -> Result<LifecycleState, BackendError> {
    let state = match status {
        "CREATE_IN_PROGRESS"
        | "REVIEW_IN_PROGRESS"
        | "IMPORT_IN_PROGRESS"
        | "UPDATE_IN_PROGRESS"
        | "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS"
        | "UPDATE_ROLLBACK_IN_PROGRESS"
        | "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS"
        | "IMPORT_ROLLBACK_IN_PROGRESS" => LifecycleState::Provisioning,
        "CREATE_COMPLETE"
        | "UPDATE_COMPLETE"
        | "IMPORT_COMPLETE"
        | "UPDATE_ROLLBACK_COMPLETE"
        | "IMPORT_ROLLBACK_COMPLETE" => LifecycleState::Active,
        "DELETE_IN_PROGRESS" => LifecycleState::Destroying,
        "DELETE_COMPLETE" => LifecycleState::Absent,
        "CREATE_FAILED"
        | "ROLLBACK_IN_PROGRESS"
        | "ROLLBACK_COMPLETE"
        | "ROLLBACK_FAILED"
        | "DELETE_FAILED"
        | "UPDATE_FAILED"
        | "UPDATE_ROLLBACK_FAILED"
        | "IMPORT_ROLLBACK_FAILED" => LifecycleState::Failed,
        other => {
            return Err(BackendError::Fatal {
                message: format!("unrecognised stack status '{other}'"),
            })
        }
    };
    Ok(state)
}

// ---------------------------------------------------------------------------
// Shared invocation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct Cli {
    pub(crate) program: String,
    pub(crate) region: Option<String>,
    pub(crate) timeout: Duration,
    pub(crate) runner: Arc<dyn CommandRunner>,
}

impl Cli {
    /// Runs one CLI call under the timeout. A non-zero exit is returned as
    /// captured output for the caller to classify.
    pub(crate) async fn run(
        &self,
        operation: &str,
        args: Vec<String>,
    ) -> Result<CommandOutput, BackendError> {
        let mut args = args;
        if let Some(region) = &self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }

        debug!(operation, program = %self.program, "Invoking AWS CLI");
        let run = self.runner.run(&self.program, &args);
        match tokio::time::timeout(self.timeout, run).await {
            Err(_) => Err(BackendError::Timeout {
                operation: operation.to_string(),
                after: self.timeout,
            }),
            Ok(Err(e)) => Err(BackendError::Fatal {
                message: format!("failed to run '{}': {e}", self.program),
            }),
            Ok(Ok(output)) => Ok(output),
        }
    }

    /// Runs one call and classifies a non-zero exit.
    pub(crate) async fn call(&self, operation: &str, args: Vec<String>) -> Result<String, BackendError> {
        let output = self.run(operation, args).await?;
        if output.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            let err = classify_error(&output.stderr);
            debug!(operation, error = %err, "AWS CLI call failed");
            Err(err)
        }
    }
}

pub(crate) fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Stack and build job backend
// ---------------------------------------------------------------------------

/// [`StackService`] and [`BuildJobService`] over the AWS CLI.
pub struct AwsCliBackend {
    settings: AwsCliSettings,
    cli: Cli,
}

impl std::fmt::Debug for AwsCliBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCliBackend")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AwsCliBackend {
    pub fn new(settings: AwsCliSettings, runner: Arc<dyn CommandRunner>) -> Self {
        let cli = Cli {
            program: settings.program.clone(),
            region: settings.region.clone(),
            timeout: settings.call_timeout,
            runner,
        };
        Self { settings, cli }
    }

    pub fn settings(&self) -> &AwsCliSettings {
        &self.settings
    }

    fn job_ref(&self, branch: &BranchName) -> Result<BuildJobRef, BackendError> {
        BuildJobRef::new(self.settings.project_name(branch)).ok_or_else(|| BackendError::Fatal {
            message: "empty build project name".to_string(),
        })
    }

    async fn delete_cfn_stack(&self, stack: &str) -> Result<(), BackendError> {
        self.cli
            .call(
                "cloudformation delete-stack",
                args(["cloudformation", "delete-stack", "--stack-name", stack]),
            )
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl StackService for AwsCliBackend {
    #[instrument(skip_all, fields(branch = %branch))]
    async fn create_stack(
        &self,
        branch: &BranchName,
        template: &TemplateRef,
    ) -> Result<StackHandle, BackendError> {
        let stack = self.settings.stack_name(branch);
        match self.stack_state(branch).await? {
            LifecycleState::Active | LifecycleState::Provisioning => {
                debug!(%stack, "Stack already present; not starting another deployment");
                return StackHandle::new(stack).ok_or_else(|| BackendError::Fatal {
                    message: "empty stack name".to_string(),
                });
            }
            LifecycleState::Destroying => {
                return Err(BackendError::Conflict {
                    message: format!("stack '{stack}' is being deleted"),
                })
            }
            LifecycleState::Absent | LifecycleState::Failed => {}
        }

        let project = self.settings.project_name(branch);
        let env = json!([
            { "name": "BRANCH", "value": branch.as_str(), "type": "PLAINTEXT" },
            { "name": "STACK_NAME", "value": stack, "type": "PLAINTEXT" },
        ])
        .to_string();
        let buildspec = self.settings.deploy_buildspec(branch, template);

        let build_id = self
            .cli
            .call(
                "codebuild start-build",
                args([
                    "codebuild",
                    "start-build",
                    "--project-name",
                    &project,
                    "--environment-variables-override",
                    &env,
                    "--buildspec-override",
                    &buildspec,
                    "--query",
                    "build.id",
                    "--output",
                    "text",
                ]),
            )
            .await?;

        info!(%project, %build_id, "Started pipeline deployment build");
        StackHandle::new(build_id).ok_or_else(|| BackendError::Fatal {
            message: "start-build returned no build id".to_string(),
        })
    }

    #[instrument(skip_all, fields(branch = %branch))]
    async fn destroy_stack(&self, branch: &BranchName) -> Result<(), BackendError> {
        let stack = self.settings.stack_name(branch);
        self.delete_cfn_stack(&stack).await?;
        info!(%stack, "Requested pipeline stack deletion");

        // Stage stacks are removed only once the pipeline deletion is accepted.
        for stage in self.settings.stage_stack_names(branch) {
            match self.delete_cfn_stack(&stage).await {
                Ok(()) => info!(stack = %stage, "Requested stage stack deletion"),
                Err(BackendError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn stack_state(&self, branch: &BranchName) -> Result<LifecycleState, BackendError> {
        let stack = self.settings.stack_name(branch);
        let result = self
            .cli
            .call(
                "cloudformation describe-stacks",
                args([
                    "cloudformation",
                    "describe-stacks",
                    "--stack-name",
                    &stack,
                    "--query",
                    "Stacks[0].StackStatus",
                    "--output",
                    "text",
                ]),
            )
            .await;

        match result {
            Ok(status) => map_stack_status(&status),
            Err(BackendError::NotFound { .. }) => Ok(LifecycleState::Absent),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl BuildJobService for AwsCliBackend {
    #[instrument(skip_all, fields(branch = %branch))]
    async fn ensure_job(&self, branch: &BranchName) -> Result<BuildJobRef, BackendError> {
        let job = self.job_ref(branch)?;
        let s = &self.settings;

        let source = json!({
            "type": "GITHUB",
            "location": s.source_location,
            "buildspec": s.project_buildspec(),
        })
        .to_string();
        let artifacts = json!({
            "type": "S3",
            "location": s.artifact_bucket,
            "path": branch.as_str(),
            "name": job.as_str(),
            "packaging": "NONE",
        })
        .to_string();
        let environment = json!({
            "type": "LINUX_CONTAINER",
            "image": s.build_image,
            "computeType": s.compute_type,
        })
        .to_string();
        let description = format!("Builds the pipeline for branch {branch}");

        let result = self
            .cli
            .call(
                "codebuild create-project",
                args([
                    "codebuild",
                    "create-project",
                    "--name",
                    job.as_str(),
                    "--description",
                    &description,
                    "--source",
                    &source,
                    "--source-version",
                    branch.as_str(),
                    "--artifacts",
                    &artifacts,
                    "--environment",
                    &environment,
                    "--service-role",
                    &s.service_role,
                ]),
            )
            .await;

        match result {
            Ok(_) => {
                info!(project = %job, "Created build project");
                Ok(job)
            }
            Err(BackendError::AlreadyExists { .. }) => {
                debug!(project = %job, "Build project already exists");
                Ok(job)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_job(&self, branch: &BranchName) -> Result<Option<BuildJobRef>, BackendError> {
        let job = self.job_ref(branch)?;
        let found = self
            .cli
            .call(
                "codebuild batch-get-projects",
                args([
                    "codebuild",
                    "batch-get-projects",
                    "--names",
                    job.as_str(),
                    "--query",
                    "projects[0].name",
                    "--output",
                    "text",
                ]),
            )
            .await?;

        if found.is_empty() || found == "None" {
            Ok(None)
        } else {
            Ok(Some(job))
        }
    }

    #[instrument(skip_all, fields(branch = %branch))]
    async fn delete_job(&self, branch: &BranchName) -> Result<(), BackendError> {
        let job = self.job_ref(branch)?;
        let project_result = self
            .cli
            .call(
                "codebuild delete-project",
                args(["codebuild", "delete-project", "--name", job.as_str()]),
            )
            .await;

        // Artifacts are removed even when the project was already gone.
        let prefix = self.settings.artifact_prefix(branch);
        if !self.settings.artifact_bucket.is_empty() {
            match self
                .cli
                .call("s3 rm", args(["s3", "rm", &prefix, "--recursive"]))
                .await
            {
                Ok(_) | Err(BackendError::NotFound { .. }) => {
                    info!(%prefix, "Removed build artifacts")
                }
                Err(e) => {
                    warn!(%prefix, error = %e, "Failed to remove build artifacts");
                    return Err(e);
                }
            }
        }

        project_result?;
        info!(project = %job, "Deleted build project");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Secrets Manager
// ---------------------------------------------------------------------------

/// [`SecretStore`] over `aws secretsmanager get-secret-value`.
///
/// The secret value is read from standard output and never logged.
pub struct AwsSecretsManager {
    cli: Cli,
}

impl std::fmt::Debug for AwsSecretsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSecretsManager")
            .field("program", &self.cli.program)
            .field("region", &self.cli.region)
            .finish_non_exhaustive()
    }
}

impl AwsSecretsManager {
    pub fn new(
        program: impl Into<String>,
        region: Option<String>,
        timeout: Duration,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            cli: Cli {
                program: program.into(),
                region,
                timeout,
                runner,
            },
        }
    }
}

#[async_trait]
impl SecretStore for AwsSecretsManager {
    async fn get_secret(&self, name: &SecretName) -> Result<SecretString, SecretError> {
        let output = self
            .cli
            .run(
                "secretsmanager get-secret-value",
                args([
                    "secretsmanager",
                    "get-secret-value",
                    "--secret-id",
                    name.as_str(),
                    "--query",
                    "SecretString",
                    "--output",
                    "text",
                ]),
            )
            .await
            .map_err(|e| SecretError::Unavailable {
                name: name.clone(),
                message: e.to_string(),
            })?;

        if !output.success() {
            let stderr = &output.stderr;
            return Err(if stderr.contains("ResourceNotFoundException") {
                SecretError::NotFound { name: name.clone() }
            } else if stderr.contains("AccessDenied") {
                SecretError::AccessDenied { name: name.clone() }
            } else {
                SecretError::Unavailable {
                    name: name.clone(),
                    message: first_line(stderr),
                }
            });
        }

        let value = output.stdout.trim_end_matches(['\r', '\n']);
        if value.is_empty() || value == "None" {
            return Err(SecretError::NotFound { name: name.clone() });
        }
        Ok(SecretString::new(value.into()))
    }
}

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;
