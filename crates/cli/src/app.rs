//! Builds the concrete adapters and controllers from [`Settings`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backend::{
    AwsCliBackend, AwsCliSettings, AwsSecretsManager, EnvSecretStore, InMemoryBackend,
    SqsEventQueue, TokioCommandRunner,
};
use controller::{
    BranchResolver, BusWorker, CachedSecretStore, CreateBranchHandler, DeleteBranchHandler,
    DeliveryWindow, EventRouter, InProcessEventBus, LifecycleController, QueueWorker,
    SignatureVerifier,
};
use domain::{BuildJobService, EventBus, EventKind, EventNormalizer, SecretStore, StackService};
use github::{GithubClient, GithubSettings};
use listener::{ListenerSettings, WebhookReceiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{BackendKind, BusKind, SecretBackendKind, Settings};

/// The two backend ports, usually backed by one adapter.
#[derive(Clone)]
pub struct Backends {
    pub stacks: Arc<dyn StackService>,
    pub jobs: Arc<dyn BuildJobService>,
}

pub fn secret_store(settings: &Settings) -> Arc<dyn SecretStore> {
    let inner: Arc<dyn SecretStore> = match settings.secrets.backend {
        SecretBackendKind::Env => Arc::new(EnvSecretStore),
        SecretBackendKind::AwsCli => Arc::new(AwsSecretsManager::new(
            settings.backend.program.as_str(),
            settings.backend.region.clone(),
            settings.call_timeout(),
            Arc::new(TokioCommandRunner),
        )),
    };
    Arc::new(CachedSecretStore::new(
        inner,
        Duration::from_secs(settings.secrets.cache_ttl_secs),
    ))
}

pub fn backends(settings: &Settings) -> Backends {
    match settings.backend.kind {
        BackendKind::Memory => {
            info!("Using the in-memory backend; pipeline state is not persisted");
            let backend = Arc::new(
                InMemoryBackend::new().with_job_prefix(settings.backend.project_prefix.as_str()),
            );
            Backends {
                stacks: backend.clone(),
                jobs: backend,
            }
        }
        BackendKind::AwsCli => {
            let b = &settings.backend;
            let aws = AwsCliSettings {
                program: b.program.clone(),
                region: b.region.clone(),
                project_prefix: b.project_prefix.clone(),
                stack_prefix: b.stack_prefix.clone(),
                stage_stacks: b.stage_stacks.clone(),
                artifact_bucket: b.artifact_bucket.clone(),
                source_location: b.source_location.clone(),
                service_role: b.service_role.clone(),
                build_image: b.build_image.clone(),
                compute_type: b.compute_type.clone(),
                call_timeout: settings.call_timeout(),
            };
            let backend = Arc::new(AwsCliBackend::new(aws, Arc::new(TokioCommandRunner)));
            Backends {
                stacks: backend.clone(),
                jobs: backend,
            }
        }
    }
}

pub fn lifecycle_controller(
    settings: &Settings,
    backends: &Backends,
) -> Result<Arc<LifecycleController>> {
    Ok(Arc::new(LifecycleController::new(
        backends.stacks.clone(),
        backends.jobs.clone(),
        settings.lifecycle()?,
    )))
}

pub fn branch_resolver(settings: &Settings, secrets: Arc<dyn SecretStore>) -> Result<BranchResolver> {
    let github = GithubClient::new(GithubSettings {
        api_base: settings.github.api_base.clone(),
        user_agent: settings.github.user_agent.clone(),
        timeout: settings.resolution_timeout(),
    })
    .context("Failed to build the repository metadata client")?;
    Ok(BranchResolver::new(
        Arc::new(github),
        secrets,
        settings.resolution_timeout(),
    ))
}

/// Subscribes the lifecycle handlers.
pub fn event_router(controller: Arc<LifecycleController>) -> EventRouter {
    EventRouter::new()
        .subscribe(
            EventKind::Created,
            Arc::new(CreateBranchHandler::new(controller.clone())),
        )
        .subscribe(
            EventKind::Deleted,
            Arc::new(DeleteBranchHandler::new(controller)),
        )
}

/// Creates the in-process bus.
pub fn event_bus(
    settings: &Settings,
    controller: Arc<LifecycleController>,
) -> (InProcessEventBus, BusWorker) {
    let router = event_router(controller);
    let window = match settings.bus.dedup_window_secs {
        0 => DeliveryWindow::disabled(),
        secs => DeliveryWindow::new(Duration::from_secs(secs), settings.bus.dedup_capacity),
    };
    InProcessEventBus::new(router, settings.bus(), window)
}

/// The bus the listener publishes to, and the running worker that drains it.
pub struct Dispatcher {
    pub bus: Arc<dyn EventBus>,
    worker: JoinHandle<()>,
    stop: Option<watch::Sender<bool>>,
}

impl Dispatcher {
    /// Starts the worker for the configured bus kind.
    pub fn start(settings: &Settings, controller: Arc<LifecycleController>) -> Result<Self> {
        match settings.bus.kind {
            BusKind::InProcess => {
                warn!("Using the in-process event bus; queued events are lost if the process exits");
                let (bus, worker) = event_bus(settings, controller);
                Ok(Self {
                    bus: Arc::new(bus),
                    worker: tokio::spawn(worker.run()),
                    stop: None,
                })
            }
            BusKind::Sqs => {
                let queue = Arc::new(SqsEventQueue::new(
                    settings.sqs()?,
                    Arc::new(TokioCommandRunner),
                ));
                info!(queue = ?queue, "Using the durable event queue");
                let worker = QueueWorker::new(
                    queue.clone(),
                    event_router(controller),
                    settings.bus.max_concurrent_handlers,
                )
                .with_max_receive_count(settings.bus.max_receive_count);
                let (stop, shutdown) = watch::channel(false);
                Ok(Self {
                    bus: queue,
                    worker: tokio::spawn(worker.run(shutdown)),
                    stop: Some(stop),
                })
            }
        }
    }

    /// Stops accepting work and waits for in-flight handlers.
    pub async fn drain(self) {
        let Self { bus, worker, stop } = self;
        drop(bus);
        if let Some(stop) = stop {
            // The worker may already have stopped.
            let _ = stop.send(true);
        }
        if let Err(e) = worker.await {
            error!(error = %e, "Event worker panicked");
        }
    }
}

pub fn webhook_receiver(
    settings: &Settings,
    secrets: Arc<dyn SecretStore>,
    bus: Arc<dyn EventBus>,
) -> Result<WebhookReceiver> {
    Ok(WebhookReceiver::new(
        SignatureVerifier::new(secrets, settings.webhook_secret()?),
        EventNormalizer::new(settings.repository()?),
        bus,
    ))
}

pub fn listener_settings(settings: &Settings) -> ListenerSettings {
    ListenerSettings {
        webhook_path: settings.server.webhook_path.clone(),
        body_limit: settings.server.body_limit_bytes,
    }
}

#[cfg(test)]
#[path = "app_tests.rs"]
mod tests;
