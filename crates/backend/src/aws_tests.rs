use super::*;
use domain::ExposeSecret;
use std::sync::Mutex;

type Responder = Box<dyn Fn(&[String]) -> CommandOutput + Send + Sync>;

struct ScriptedRunner {
    calls: Mutex<Vec<Vec<String>>>,
    respond: Responder,
}

impl ScriptedRunner {
    fn new(respond: impl Fn(&[String]) -> CommandOutput + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// `service operation` of every call, e.g. `"codebuild start-build"`.
    fn operations(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| format!("{} {}", c[0], c[1]))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, _program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(args.to_vec());
        Ok((self.respond)(args))
    }
}

struct HangingRunner;

#[async_trait]
impl CommandRunner for HangingRunner {
    async fn run(&self, _program: &str, _args: &[String]) -> std::io::Result<CommandOutput> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(ok(""))
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn fail(stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(254),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

const STACK_MISSING: &str = "\nAn error occurred (ValidationError) when calling the DescribeStacks operation: Stack with id cdk-pipelines-multi-branch-feat-1 does not exist\n";

fn settings() -> AwsCliSettings {
    AwsCliSettings {
        artifact_bucket: "artifacts".to_string(),
        source_location: "https://github.com/octo-org/widgets.git".to_string(),
        service_role: "arn:aws:iam::123456789012:role/build".to_string(),
        stage_stacks: vec!["DEV-InfraStack-{branch}".to_string()],
        ..AwsCliSettings::default()
    }
}

fn branch() -> BranchName {
    BranchName::parse("feat-1").unwrap()
}

fn template() -> TemplateRef {
    TemplateRef::new("python3 app.py").unwrap()
}

// ---------------------------------------------------------------------------
// Naming and classification
// ---------------------------------------------------------------------------

#[test]
fn test_resource_names_derive_from_branch() {
    let s = settings();
    let b = branch();

    assert_eq!(s.project_name(&b), "branchfleet-feat-1-create");
    assert_eq!(s.stack_name(&b), "cdk-pipelines-multi-branch-feat-1");
    assert_eq!(s.stage_stack_names(&b), vec!["DEV-InfraStack-feat-1"]);
    assert_eq!(s.artifact_prefix(&b), "s3://artifacts/feat-1");
}

#[test]
fn test_stack_status_mapping() {
    use LifecycleState::*;
    for (status, expected) in [
        ("CREATE_IN_PROGRESS", Provisioning),
        ("UPDATE_IN_PROGRESS", Provisioning),
        ("CREATE_COMPLETE", Active),
        ("UPDATE_ROLLBACK_COMPLETE", Active),
        ("DELETE_IN_PROGRESS", Destroying),
        ("DELETE_COMPLETE", Absent),
        ("ROLLBACK_COMPLETE", Failed),
        ("DELETE_FAILED", Failed),
    ] {
        assert_eq!(map_stack_status(status), Ok(expected), "{status}");
    }
    assert!(matches!(
        map_stack_status("SOMETHING_NEW"),
        Err(BackendError::Fatal { .. })
    ));
}

#[test]
fn test_error_classification() {
    assert!(matches!(
        classify_error("An error occurred (ResourceAlreadyExistsException) when calling the CreateProject operation"),
        BackendError::AlreadyExists { .. }
    ));
    assert!(matches!(classify_error(STACK_MISSING), BackendError::NotFound { .. }));
    assert!(matches!(
        classify_error("An error occurred (ThrottlingException): Rate exceeded"),
        BackendError::Transient { .. }
    ));
    assert!(matches!(
        classify_error("An error occurred (AccessDeniedException) when calling the StartBuild operation"),
        BackendError::Fatal { .. }
    ));
}

#[test]
fn test_classified_message_is_first_non_empty_line() {
    match classify_error(STACK_MISSING) {
        BackendError::NotFound { resource } => assert!(resource.starts_with("An error occurred")),
        other => panic!("unexpected {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Stack service
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_missing_stack_reads_as_absent() {
    let runner = ScriptedRunner::new(|_| fail(STACK_MISSING));
    let backend = AwsCliBackend::new(settings(), runner);

    assert_eq!(backend.stack_state(&branch()).await, Ok(LifecycleState::Absent));
}

#[tokio::test]
async fn test_create_starts_deployment_build_when_absent() {
    let runner = ScriptedRunner::new(|args| match args[1].as_str() {
        "describe-stacks" => fail(STACK_MISSING),
        "start-build" => ok("branchfleet-feat-1-create:0b1c\n"),
        other => panic!("unexpected call {other}"),
    });
    let backend = AwsCliBackend::new(settings(), runner.clone());

    let handle = backend.create_stack(&branch(), &template()).await.unwrap();

    assert_eq!(handle.as_str(), "branchfleet-feat-1-create:0b1c");
    let start = runner.calls().into_iter().nth(1).unwrap();
    assert!(start.contains(&"branchfleet-feat-1-create".to_string()));
    let buildspec_at = start.iter().position(|a| a == "--buildspec-override").unwrap();
    assert!(start[buildspec_at + 1]
        .contains("cdk deploy cdk-pipelines-multi-branch-feat-1 --app \"python3 app.py\""));
}

#[tokio::test]
async fn test_create_of_active_stack_starts_no_build() {
    let runner = ScriptedRunner::new(|_| ok("CREATE_COMPLETE\n"));
    let backend = AwsCliBackend::new(settings(), runner.clone());

    let handle = backend.create_stack(&branch(), &template()).await.unwrap();

    assert_eq!(handle.as_str(), "cdk-pipelines-multi-branch-feat-1");
    assert_eq!(runner.operations(), vec!["cloudformation describe-stacks"]);
}

#[tokio::test]
async fn test_create_while_deleting_conflicts() {
    let runner = ScriptedRunner::new(|_| ok("DELETE_IN_PROGRESS"));
    let backend = AwsCliBackend::new(settings(), runner);

    assert!(matches!(
        backend.create_stack(&branch(), &template()).await,
        Err(BackendError::Conflict { .. })
    ));
}

#[tokio::test]
async fn test_destroy_removes_pipeline_then_stage_stacks() {
    let runner = ScriptedRunner::new(|_| ok(""));
    let backend = AwsCliBackend::new(settings(), runner.clone());

    backend.destroy_stack(&branch()).await.unwrap();

    let stacks: Vec<String> = runner.calls().iter().map(|c| c[3].clone()).collect();
    assert_eq!(
        stacks,
        vec!["cdk-pipelines-multi-branch-feat-1", "DEV-InfraStack-feat-1"]
    );
}

#[tokio::test]
async fn test_region_is_appended_to_every_call() {
    let runner = ScriptedRunner::new(|_| ok("CREATE_COMPLETE"));
    let s = AwsCliSettings {
        region: Some("eu-west-1".to_string()),
        ..settings()
    };
    let backend = AwsCliBackend::new(s, runner.clone());

    backend.stack_state(&branch()).await.unwrap();

    let call = &runner.calls()[0];
    assert_eq!(&call[call.len() - 2..], ["--region", "eu-west-1"]);
}

#[tokio::test]
async fn test_hanging_call_times_out() {
    let s = AwsCliSettings {
        call_timeout: Duration::from_millis(20),
        ..settings()
    };
    let backend = AwsCliBackend::new(s, Arc::new(HangingRunner));

    assert!(matches!(
        backend.stack_state(&branch()).await,
        Err(BackendError::Timeout { .. })
    ));
}

// ---------------------------------------------------------------------------
// Build jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ensure_job_accepts_existing_project() {
    let runner = ScriptedRunner::new(|_| {
        fail("An error occurred (ResourceAlreadyExistsException) when calling the CreateProject operation: Project already exists: branchfleet-feat-1-create")
    });
    let backend = AwsCliBackend::new(settings(), runner);

    let job = backend.ensure_job(&branch()).await.unwrap();
    assert_eq!(job.as_str(), "branchfleet-feat-1-create");
}

#[tokio::test]
async fn test_find_job_reports_missing_project() {
    let runner = ScriptedRunner::new(|_| ok("None\n"));
    let backend = AwsCliBackend::new(settings(), runner);

    assert_eq!(backend.find_job(&branch()).await, Ok(None));
}

#[tokio::test]
async fn test_delete_job_removes_project_and_artifacts() {
    let runner = ScriptedRunner::new(|_| ok(""));
    let backend = AwsCliBackend::new(settings(), runner.clone());

    backend.delete_job(&branch()).await.unwrap();

    assert_eq!(
        runner.operations(),
        vec!["codebuild delete-project", "s3 rm"]
    );
    assert!(runner.calls()[1].contains(&"s3://artifacts/feat-1".to_string()));
}

// ---------------------------------------------------------------------------
// Secrets Manager
// ---------------------------------------------------------------------------

fn secrets(runner: Arc<dyn CommandRunner>) -> AwsSecretsManager {
    AwsSecretsManager::new("aws", None, Duration::from_secs(5), runner)
}

fn secret_name() -> SecretName {
    SecretName::new("github-webhook-secret").unwrap()
}

#[tokio::test]
async fn test_secret_value_is_read_without_trailing_newline() {
    let store = secrets(ScriptedRunner::new(|_| ok("s3cret\n")));

    let value = store.get_secret(&secret_name()).await.unwrap();
    assert_eq!(value.expose_secret(), "s3cret");
}

#[tokio::test]
async fn test_missing_secret_is_not_found() {
    let store = secrets(ScriptedRunner::new(|_| {
        fail("An error occurred (ResourceNotFoundException) when calling the GetSecretValue operation: Secrets Manager can't find the specified secret.")
    }));

    assert_eq!(
        store.get_secret(&secret_name()).await.unwrap_err(),
        SecretError::NotFound {
            name: secret_name()
        }
    );
}

#[tokio::test]
async fn test_denied_secret_is_access_denied() {
    let store = secrets(ScriptedRunner::new(|_| {
        fail("An error occurred (AccessDeniedException) when calling the GetSecretValue operation")
    }));

    assert!(matches!(
        store.get_secret(&secret_name()).await,
        Err(SecretError::AccessDenied { .. })
    ));
}
