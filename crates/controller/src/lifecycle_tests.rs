use super::*;
use backend::{InMemoryBackend, Operation};
use domain::{ErrorKind, RepositoryId, Timestamp};

fn branch(name: &str) -> BranchName {
    BranchName::parse(name).unwrap()
}

fn settings() -> LifecycleSettings {
    LifecycleSettings {
        template: TemplateRef::new("python3 app.py").unwrap(),
        call_timeout: Duration::from_secs(1),
        settle_poll_interval: Duration::from_millis(1),
        settle_timeout: Duration::from_secs(1),
    }
}

fn controller_with(
    backend: InMemoryBackend,
    settings: LifecycleSettings,
) -> (Arc<InMemoryBackend>, LifecycleController) {
    let backend = Arc::new(backend);
    let controller = LifecycleController::new(backend.clone(), backend.clone(), settings);
    (backend, controller)
}

fn controller() -> (Arc<InMemoryBackend>, LifecycleController) {
    controller_with(InMemoryBackend::new(), settings())
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_provisions_job_and_stack() {
    let (backend, controller) = controller();

    let outcome = controller.on_branch_created("user-feature-123").await.unwrap();

    let b = branch("user-feature-123");
    assert_eq!(outcome.action, LifecycleAction::Provisioned);
    assert_eq!(outcome.resource.lifecycle_state, LifecycleState::Active);
    assert_eq!(
        outcome.resource.build_job_ref.as_ref().map(|j| j.as_str()),
        Some("branchfleet-user-feature-123-create")
    );
    assert_eq!(backend.peek_state(&b), LifecycleState::Active);
    assert!(backend.has_job(&b));
}

#[tokio::test]
async fn test_job_is_created_before_stack() {
    let (backend, controller) = controller();
    controller.on_branch_created("feat-1").await.unwrap();

    let mutations: Vec<Operation> = backend
        .calls()
        .into_iter()
        .map(|c| c.operation)
        .filter(|op| op.is_mutation())
        .collect();
    assert_eq!(mutations, vec![Operation::EnsureJob, Operation::CreateStack]);
}

#[tokio::test]
async fn test_duplicate_create_does_not_create_twice() {
    let (backend, controller) = controller();

    let first = controller.on_branch_created("feat-1").await.unwrap();
    let second = controller.on_branch_created("feat-1").await.unwrap();

    assert_eq!(first.resource.lifecycle_state, LifecycleState::Active);
    assert_eq!(second.resource.lifecycle_state, LifecycleState::Active);
    assert_eq!(second.action, LifecycleAction::NoOp);
    assert_eq!(backend.call_count(Operation::CreateStack, &branch("feat-1")), 1);
}

#[tokio::test]
async fn test_create_while_provisioning_is_a_no_op() {
    let (backend, controller) = controller();
    let b = branch("feat-1");
    backend.seed(&b, LifecycleState::Provisioning);

    let outcome = controller.on_branch_created("feat-1").await.unwrap();

    assert_eq!(outcome.action, LifecycleAction::NoOp);
    assert_eq!(backend.mutation_count(&b), 0);
}

#[tokio::test]
async fn test_overlong_name_is_rejected_before_any_backend_call() {
    let (backend, controller) = controller();
    let name = format!("feature-abc{}", "x".repeat(80));

    let err = controller.on_branch_created(&name).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    assert!(matches!(
        err,
        ControllerError::InvalidBranchName(domain::BranchNameError::TooLong { .. })
    ));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_slash_in_name_is_rejected_before_any_backend_call() {
    let (backend, controller) = controller();

    let err = controller.on_branch_deleted("feature/abc").await.unwrap_err();

    assert_eq!(err.reason_code(), "validation_failure");
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_create_waits_for_asynchronous_settling() {
    let (backend, controller) =
        controller_with(InMemoryBackend::new().with_settle_polls(3), settings());
    let b = branch("feat-1");

    let outcome = controller.on_branch_created("feat-1").await.unwrap();

    assert_eq!(outcome.resource.lifecycle_state, LifecycleState::Active);
    assert!(backend.call_count(Operation::StackState, &b) >= 4);
}

#[tokio::test]
async fn test_create_that_never_settles_is_transient() {
    let s = LifecycleSettings {
        settle_timeout: Duration::from_millis(20),
        ..settings()
    };
    let (_backend, controller) =
        controller_with(InMemoryBackend::new().with_settle_polls(u32::MAX), s);

    let err = controller.on_branch_created("feat-1").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transient);
}

#[tokio::test]
async fn test_slow_backend_call_times_out_as_transient() {
    let s = LifecycleSettings {
        call_timeout: Duration::from_millis(20),
        ..settings()
    };
    let (_backend, controller) = controller_with(
        InMemoryBackend::new().with_latency(Duration::from_millis(500)),
        s,
    );

    let err = controller.on_branch_created("feat-1").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(matches!(
        err.retry_policy(),
        domain::RetryPolicy::Retryable { .. }
    ));
}

// ---------------------------------------------------------------------------
// Failure and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_provisioning_is_surfaced_and_recoverable() {
    let (backend, controller) = controller();
    let b = branch("feat-1");
    backend.fail_next_settle();

    let err = controller.on_branch_created("feat-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(backend.peek_state(&b), LifecycleState::Failed);

    let outcome = controller.on_branch_created("feat-1").await.unwrap();
    assert_eq!(outcome.action, LifecycleAction::Provisioned);
    assert_eq!(backend.peek_state(&b), LifecycleState::Active);
}

#[tokio::test]
async fn test_transient_create_failure_is_surfaced_and_retryable() {
    let (backend, controller) = controller();
    backend.fail_next(
        Operation::CreateStack,
        BackendError::Transient {
            message: "throttled".into(),
        },
    );

    let err = controller.on_branch_created("feat-1").await.unwrap_err();
    assert_eq!(err.reason_code(), "transient");

    let outcome = controller.on_branch_created("feat-1").await.unwrap();
    assert_eq!(outcome.resource.lifecycle_state, LifecycleState::Active);
}

#[tokio::test]
async fn test_failed_stack_can_be_torn_down() {
    let (backend, controller) = controller();
    let b = branch("feat-1");
    backend.seed(&b, LifecycleState::Failed);
    backend.seed_job(&b);

    let outcome = controller.on_branch_deleted("feat-1").await.unwrap();

    assert_eq!(outcome.action, LifecycleAction::Destroyed);
    assert_eq!(backend.peek_state(&b), LifecycleState::Absent);
    assert!(!backend.has_job(&b));
}

// ---------------------------------------------------------------------------
// Destroy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_delete_of_active_branch_removes_stack_and_job() {
    let (backend, controller) = controller();
    let b = branch("user-feature-123");
    controller.on_branch_created("user-feature-123").await.unwrap();

    let outcome = controller.on_branch_deleted("user-feature-123").await.unwrap();

    assert_eq!(outcome.action, LifecycleAction::Destroyed);
    assert_eq!(outcome.resource.lifecycle_state, LifecycleState::Absent);
    assert_eq!(backend.peek_state(&b), LifecycleState::Absent);
    assert!(!backend.has_job(&b));
}

#[tokio::test]
async fn test_stack_teardown_is_requested_before_job_removal() {
    let (backend, controller) = controller();
    let b = branch("feat-1");
    backend.seed(&b, LifecycleState::Active);
    backend.seed_job(&b);

    controller.on_branch_deleted("feat-1").await.unwrap();

    let ops: Vec<Operation> = backend
        .calls()
        .into_iter()
        .map(|c| c.operation)
        .filter(|op| op.is_mutation())
        .collect();
    assert_eq!(ops, vec![Operation::DestroyStack, Operation::DeleteJob]);
}

#[tokio::test]
async fn test_delete_of_absent_branch_makes_no_mutating_calls() {
    let (backend, controller) = controller();

    let outcome = controller.on_branch_deleted("feat-1").await.unwrap();

    assert_eq!(outcome.action, LifecycleAction::NoOp);
    assert_eq!(backend.mutation_count(&branch("feat-1")), 0);
}

#[tokio::test]
async fn test_already_deleted_responses_are_success() {
    let (backend, controller) = controller();
    let b = branch("feat-1");
    // Removed out of band between the state read and the teardown request.
    backend.seed_settling(&b, LifecycleState::Active, LifecycleState::Absent, 1);
    backend.fail_next(
        Operation::DestroyStack,
        BackendError::NotFound {
            resource: "stack".into(),
        },
    );

    // No job seeded either, so the job deletion reports not found as well.
    let outcome = controller.on_branch_deleted("feat-1").await.unwrap();

    assert_eq!(outcome.action, LifecycleAction::Destroyed);
}

#[tokio::test]
async fn test_orphaned_job_is_removed_when_stack_is_absent() {
    let (backend, controller) = controller();
    let b = branch("feat-1");
    backend.seed_job(&b);

    let outcome = controller.on_branch_deleted("feat-1").await.unwrap();

    assert_eq!(outcome.action, LifecycleAction::Destroyed);
    assert!(!backend.has_job(&b));
    assert_eq!(backend.call_count(Operation::DestroyStack, &b), 0);
}

// ---------------------------------------------------------------------------
// Ordering and concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_out_of_order_delete_then_create_ends_active() {
    let (backend, controller) = controller();

    controller.on_branch_deleted("feat-1").await.unwrap();
    controller.on_branch_created("feat-1").await.unwrap();

    assert_eq!(backend.peek_state(&branch("feat-1")), LifecycleState::Active);
}

#[tokio::test]
async fn test_create_waits_out_in_flight_teardown() {
    let (backend, controller) = controller();
    let b = branch("feat-1");
    backend.seed_settling(&b, LifecycleState::Destroying, LifecycleState::Absent, 2);

    let outcome = controller.on_branch_created("feat-1").await.unwrap();

    assert_eq!(outcome.action, LifecycleAction::Provisioned);
    assert_eq!(backend.peek_state(&b), LifecycleState::Active);
}

#[tokio::test]
async fn test_create_during_stuck_teardown_conflicts() {
    let s = LifecycleSettings {
        settle_timeout: Duration::from_millis(20),
        ..settings()
    };
    let (backend, controller) = controller_with(InMemoryBackend::new(), s);
    let b = branch("feat-1");
    backend.seed(&b, LifecycleState::Destroying);

    let err = controller.on_branch_created("feat-1").await.unwrap_err();

    assert_eq!(
        err,
        ControllerError::Conflict {
            branch: b.clone(),
            observed: LifecycleState::Destroying,
            requested: EventKind::Created,
        }
    );
    assert_eq!(backend.mutation_count(&b), 0);
}

#[tokio::test]
async fn test_delete_waits_out_in_flight_provisioning() {
    let (backend, controller) = controller();
    let b = branch("feat-1");
    backend.seed_settling(&b, LifecycleState::Provisioning, LifecycleState::Active, 2);
    backend.seed_job(&b);

    let outcome = controller.on_branch_deleted("feat-1").await.unwrap();

    assert_eq!(outcome.action, LifecycleAction::Destroyed);
    assert_eq!(backend.peek_state(&b), LifecycleState::Absent);
}

#[tokio::test]
async fn test_concurrent_create_and_delete_do_not_interleave() {
    let (backend, controller) = controller_with(
        InMemoryBackend::new().with_latency(Duration::from_millis(5)),
        settings(),
    );

    let (created, deleted) = tokio::join!(
        controller.on_branch_created("feat-1"),
        controller.on_branch_deleted("feat-1"),
    );
    created.unwrap();
    deleted.unwrap();

    assert_eq!(backend.max_concurrent_mutations(), 1);
    // The create claimed the branch first, so the delete was applied last.
    assert_eq!(backend.peek_state(&branch("feat-1")), LifecycleState::Absent);
}

// ---------------------------------------------------------------------------
// Describe and handlers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_describe_reports_backend_view() {
    let (backend, controller) = controller();
    let b = branch("feat-1");
    backend.seed(&b, LifecycleState::Provisioning);

    let resource = controller.describe("feat-1").await.unwrap();

    assert_eq!(resource.lifecycle_state, LifecycleState::Provisioning);
    assert_eq!(resource.build_job_ref, None);
    assert_eq!(backend.mutation_count(&b), 0);
}

fn event(kind: EventKind, name: &str) -> BranchEvent {
    BranchEvent {
        kind,
        branch_name: branch(name),
        repository: RepositoryId::parse("octo-org/widgets").unwrap(),
        delivery_id: None,
        sender: None,
        received_at: Timestamp::now(),
    }
}

#[tokio::test]
async fn test_handlers_drive_the_controller() {
    let (backend, controller) = controller();
    let controller = Arc::new(controller);
    let create = CreateBranchHandler::new(controller.clone());
    let delete = DeleteBranchHandler::new(controller);

    create.handle(&event(EventKind::Created, "feat-1")).await.unwrap();
    assert_eq!(backend.peek_state(&branch("feat-1")), LifecycleState::Active);

    delete.handle(&event(EventKind::Deleted, "feat-1")).await.unwrap();
    assert_eq!(backend.peek_state(&branch("feat-1")), LifecycleState::Absent);
}

// ---------------------------------------------------------------------------
// Retrying a failed stack over the AWS CLI backend
// ---------------------------------------------------------------------------

const STACK_MISSING: &str =
    "An error occurred (ValidationError) when calling the DescribeStacks operation: Stack with id cdk-pipelines-multi-branch-feat-1 does not exist";

/// Answers `describe-stacks` from a list of statuses that only starts
/// advancing once the triggering request (`start-build` or `delete-stack`)
/// has been made. Before that, and while the list is exhausted, the last
/// entry repeats.
struct CloudFormationScript {
    trigger: &'static str,
    before: &'static str,
    after: Vec<&'static str>,
    progress: std::sync::Mutex<Option<usize>>,
}

impl CloudFormationScript {
    fn new(trigger: &'static str, before: &'static str, after: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            trigger,
            before,
            after,
            progress: std::sync::Mutex::new(None),
        })
    }

    fn describe(&self) -> &'static str {
        let mut progress = self.progress.lock().unwrap();
        match progress.as_mut() {
            None => self.before,
            Some(n) => {
                let status = self.after[(*n).min(self.after.len() - 1)];
                *n += 1;
                status
            }
        }
    }
}

#[async_trait]
impl backend::CommandRunner for CloudFormationScript {
    async fn run(
        &self,
        _program: &str,
        args: &[String],
    ) -> std::io::Result<backend::CommandOutput> {
        let ok = |stdout: &str| backend::CommandOutput {
            status: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        };
        if args[1] == self.trigger {
            *self.progress.lock().unwrap() = Some(0);
        }
        Ok(match args[1].as_str() {
            "describe-stacks" => match self.describe() {
                "MISSING" => backend::CommandOutput {
                    status: Some(254),
                    stdout: String::new(),
                    stderr: STACK_MISSING.to_string(),
                },
                status => ok(status),
            },
            "start-build" => ok("branchfleet-feat-1-create:build-2"),
            _ => ok(""),
        })
    }
}

fn aws_controller(
    script: Arc<CloudFormationScript>,
    settle_timeout: Duration,
) -> LifecycleController {
    let backend = Arc::new(backend::AwsCliBackend::new(
        backend::AwsCliSettings::default(),
        script,
    ));
    let settings = LifecycleSettings {
        settle_timeout,
        ..settings()
    };
    LifecycleController::new(backend.clone(), backend, settings)
}

#[tokio::test]
async fn test_retry_from_failed_waits_past_stale_rollback_status() {
    let script = CloudFormationScript::new(
        "start-build",
        "ROLLBACK_COMPLETE",
        vec![
            "ROLLBACK_COMPLETE",
            "ROLLBACK_COMPLETE",
            "ROLLBACK_COMPLETE",
            "CREATE_IN_PROGRESS",
            "CREATE_COMPLETE",
        ],
    );
    let controller = aws_controller(script, Duration::from_secs(5));

    let outcome = controller.on_branch_created("feat-1").await.unwrap();

    assert_eq!(outcome.action, LifecycleAction::Provisioned);
    assert_eq!(outcome.resource.lifecycle_state, LifecycleState::Active);
}

#[tokio::test]
async fn test_retry_that_never_leaves_failed_reports_failure_at_deadline() {
    let script = CloudFormationScript::new(
        "start-build",
        "ROLLBACK_COMPLETE",
        vec!["ROLLBACK_COMPLETE"],
    );
    let controller = aws_controller(script, Duration::from_millis(50));

    let err = controller.on_branch_created("feat-1").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Fatal);
}

#[tokio::test]
async fn test_retry_after_fresh_failure_reports_it_without_waiting() {
    let script = CloudFormationScript::new(
        "start-build",
        "ROLLBACK_COMPLETE",
        vec!["CREATE_IN_PROGRESS", "ROLLBACK_COMPLETE"],
    );
    let controller = aws_controller(script, Duration::from_secs(30));

    let started = tokio::time::Instant::now();
    let err = controller.on_branch_created("feat-1").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_teardown_of_failed_stack_waits_past_stale_status() {
    let script = CloudFormationScript::new(
        "delete-stack",
        "ROLLBACK_COMPLETE",
        vec!["ROLLBACK_COMPLETE", "DELETE_IN_PROGRESS", "MISSING"],
    );
    let controller = aws_controller(script, Duration::from_secs(5));

    let outcome = controller.on_branch_deleted("feat-1").await.unwrap();

    assert_eq!(outcome.action, LifecycleAction::Destroyed);
    assert_eq!(outcome.resource.lifecycle_state, LifecycleState::Absent);
}
