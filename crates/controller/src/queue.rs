//! Consumer side of a durable [`EventQueue`].
//!
//! A message is acknowledged only after its handler succeeded, or failed in
//! a way re-delivery cannot fix. Retryable failures stay on the queue and
//! come back once their visibility timeout lapses, until the event has been
//! received `max_receive_count` times; it is then dropped with an error.

use std::sync::Arc;
use std::time::Duration;

use domain::{EventQueue, QueuedEvent, RetryPolicy};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::router::EventRouter;

/// Pause after a failed receive call.
const DEFAULT_RECEIVE_BACKOFF: Duration = Duration::from_secs(5);

/// Deliveries an event gets before a retryable failure is final.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;

/// Polls an [`EventQueue`] and runs handlers.
pub struct QueueWorker {
    queue: Arc<dyn EventQueue>,
    router: Arc<EventRouter>,
    permits: Arc<Semaphore>,
    receive_backoff: Duration,
    max_receive_count: u32,
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("router", &self.router)
            .field("max_receive_count", &self.max_receive_count)
            .finish_non_exhaustive()
    }
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        router: EventRouter,
        max_concurrent_handlers: usize,
    ) -> Self {
        Self {
            queue,
            router: Arc::new(router),
            permits: Arc::new(Semaphore::new(max_concurrent_handlers.max(1))),
            receive_backoff: DEFAULT_RECEIVE_BACKOFF,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
        }
    }

    pub fn with_receive_backoff(mut self, backoff: Duration) -> Self {
        self.receive_backoff = backoff;
        self
    }

    /// Sets how many deliveries an event gets before a retryable failure is
    /// treated as final. Values below 1 count as 1.
    pub fn with_max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = count.max(1);
        self
    }

    /// Runs until `shutdown` turns true or its sender is dropped, then waits
    /// for in-flight handlers.
    ///
    /// A receive call in progress is allowed to finish so the messages it
    /// returns are handled rather than left invisible on the queue.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        while !stopping(&shutdown) {
            while let Some(joined) = tasks.try_join_next() {
                report_join(joined);
            }

            let batch = match self.queue.receive().await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, backoff = ?self.receive_backoff, "Receiving from the event queue failed");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.receive_backoff) => {}
                    }
                    continue;
                }
            };
            if !batch.is_empty() {
                debug!(messages = batch.len(), "Received queued branch events");
            }

            for queued in batch {
                let Ok(permit) = self.permits.clone().acquire_owned().await else {
                    break;
                };
                let queue = self.queue.clone();
                let router = self.router.clone();
                let max_receive_count = self.max_receive_count;
                tasks.spawn(async move {
                    dispatch(queue.as_ref(), &router, queued, max_receive_count).await;
                    drop(permit);
                });
            }
        }

        debug!(in_flight = tasks.len(), "Event queue worker stopping; draining handlers");
        while let Some(joined) = tasks.join_next().await {
            report_join(joined);
        }
        info!("Event queue worker stopped");
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn dispatch(
    queue: &dyn EventQueue,
    router: &EventRouter,
    queued: QueuedEvent,
    max_receive_count: u32,
) {
    let QueuedEvent {
        receipt,
        event,
        receive_count,
    } = queued;
    let span = info_span!(
        "branch_event",
        kind = %event.kind,
        branch = %event.branch_name,
        delivery_id = event.delivery_id.as_ref().map(|d| d.as_str()).unwrap_or("-"),
        receive_count,
    );
    async {
        let settled = match router.route(&event).await {
            Ok(()) => {
                info!("Branch event handled");
                true
            }
            Err(err) => match err.retry_policy() {
                RetryPolicy::NonRetryable => {
                    error!(
                        reason_code = err.reason_code(),
                        error = %err,
                        "Branch event failed and cannot succeed on redelivery; removing it"
                    );
                    true
                }
                RetryPolicy::Retryable { .. } if receive_count >= max_receive_count => {
                    error!(
                        reason_code = err.reason_code(),
                        error = %err,
                        max_receive_count,
                        "Branch event failed on its last allowed delivery; removing it"
                    );
                    true
                }
                RetryPolicy::Retryable { .. } => {
                    warn!(
                        reason_code = err.reason_code(),
                        error = %err,
                        "Branch event failed; left on the queue for redelivery"
                    );
                    false
                }
            },
        };
        if settled {
            if let Err(e) = queue.acknowledge(&receipt).await {
                warn!(error = %e, "Failed to acknowledge branch event; it will be delivered again");
            }
        }
    }
    .instrument(span)
    .await;
}

fn report_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "Branch event handler task ended abnormally");
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
