//! Event Router and in-process event bus.
//!
//! [`InProcessEventBus::publish`] returns as soon as the event is queued on a
//! bounded channel; a [`BusWorker`] drains the channel and runs handlers
//! concurrently. Per-branch ordering is enforced by the lifecycle
//! controller's branch claims, not here.
//!
//! Queued events live only in process memory and are lost if the process
//! exits before they are handled. The in-process bus is for development and
//! tests; `serve` uses a durable queue and [`crate::QueueWorker`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use domain::{BranchEvent, BranchEventHandler, BusError, ControllerError, EventBus, EventKind};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::dedup::DeliveryWindow;

/// Dispatches each event to the handler subscribed for its kind.
#[derive(Default, Clone)]
pub struct EventRouter {
    handlers: HashMap<EventKind, Arc<dyn BranchEventHandler>>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to `kind`, replacing any previous subscriber.
    pub fn subscribe(mut self, kind: EventKind, handler: Arc<dyn BranchEventHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn has_subscriber(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Runs the subscribed handler for `event`.
    pub async fn route(&self, event: &BranchEvent) -> Result<(), ControllerError> {
        let handler = self.handlers.get(&event.kind).ok_or_else(|| {
            ControllerError::fatal(
                "route",
                format!("no handler subscribed for '{}' events", event.kind),
            )
        })?;
        handler.handle(event).await
    }
}

/// Settings for [`InProcessEventBus`].
#[derive(Debug, Clone, Copy)]
pub struct BusSettings {
    /// Events that can be queued before `publish` waits.
    pub capacity: usize,
    /// Handlers allowed to run at once across all branches.
    pub max_concurrent_handlers: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            capacity: 256,
            max_concurrent_handlers: 32,
        }
    }
}

/// In-process [`EventBus`] with delivery id de-duplication.
pub struct InProcessEventBus {
    sender: mpsc::Sender<BranchEvent>,
    router: Arc<EventRouter>,
    window: Arc<Mutex<DeliveryWindow>>,
}

impl std::fmt::Debug for InProcessEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessEventBus")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl InProcessEventBus {
    /// Creates the bus and the worker that drains it.
    ///
    /// The worker stops once every clone of the bus has been dropped and the
    /// queue is empty.
    pub fn new(
        router: EventRouter,
        settings: BusSettings,
        window: DeliveryWindow,
    ) -> (Self, BusWorker) {
        let (sender, receiver) = mpsc::channel(settings.capacity.max(1));
        let router = Arc::new(router);
        let window = Arc::new(Mutex::new(window));
        let worker = BusWorker {
            receiver,
            router: router.clone(),
            window: window.clone(),
            permits: Arc::new(Semaphore::new(settings.max_concurrent_handlers.max(1))),
        };
        (
            Self {
                sender,
                router,
                window,
            },
            worker,
        )
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn publish(&self, event: BranchEvent) -> Result<(), BusError> {
        if !self.router.has_subscriber(event.kind) {
            return Err(BusError::NoSubscriber { kind: event.kind });
        }

        if let Some(id) = &event.delivery_id {
            let fresh = self
                .window
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id.clone(), Instant::now());
            if !fresh {
                info!(delivery_id = %id, branch = %event.branch_name, "Duplicate delivery; already dispatched");
                return Ok(());
            }
        }

        let delivery_id = event.delivery_id.clone();
        if self.sender.send(event).await.is_err() {
            if let Some(id) = delivery_id {
                forget(&self.window, &id);
            }
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

/// Drains an [`InProcessEventBus`] and runs handlers.
pub struct BusWorker {
    receiver: mpsc::Receiver<BranchEvent>,
    router: Arc<EventRouter>,
    window: Arc<Mutex<DeliveryWindow>>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for BusWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusWorker").finish_non_exhaustive()
    }
}

impl BusWorker {
    /// Runs until the bus is closed, then waits for in-flight handlers.
    pub async fn run(mut self) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                received = self.receiver.recv() => {
                    let Some(event) = received else { break };
                    let Ok(permit) = self.permits.clone().acquire_owned().await else { break };
                    let router = self.router.clone();
                    let window = self.window.clone();
                    tasks.spawn(async move {
                        dispatch(&router, &window, event).await;
                        drop(permit);
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    report_join(joined);
                }
            }
        }

        debug!(in_flight = tasks.len(), "Event bus closed; draining handlers");
        while let Some(joined) = tasks.join_next().await {
            report_join(joined);
        }
        info!("Event bus drained");
    }
}

async fn dispatch(router: &EventRouter, window: &Mutex<DeliveryWindow>, event: BranchEvent) {
    let span = info_span!(
        "branch_event",
        kind = %event.kind,
        branch = %event.branch_name,
        delivery_id = event.delivery_id.as_ref().map(|d| d.as_str()).unwrap_or("-"),
    );
    async {
        match router.route(&event).await {
            Ok(()) => info!("Branch event handled"),
            Err(err) => {
                error!(
                    reason_code = err.reason_code(),
                    retry = ?err.retry_policy(),
                    error = %err,
                    "Branch event failed"
                );
                // A redelivery of a failed event must run again.
                if let Some(id) = &event.delivery_id {
                    forget(window, id);
                }
            }
        }
    }
    .instrument(span)
    .await;
}

fn forget(window: &Mutex<DeliveryWindow>, id: &domain::DeliveryId) {
    window
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(id);
}

fn report_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "Branch event handler task ended abnormally");
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
