//! Durable event queue over `aws sqs`.
//!
//! Events are stored as JSON message bodies. A FIFO queue (URL ending in
//! `.fifo`) groups messages by branch name so the queue itself keeps each
//! branch's events in order, and de-duplicates by delivery id.
//!
//! Unlike the in-process bus, which forgets a delivery id once its handler
//! fails, SQS drops any message whose delivery id it has seen in the last
//! five minutes. A provider redelivery of a failed event inside that window
//! is therefore lost; re-issue the event instead, which sends a fresh
//! delivery id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{BackendError, BranchEvent, BusError, EventBus, EventQueue, QueuedEvent, TraceId};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::aws::{args, Cli};
use crate::command::CommandRunner;

/// SQS caps one receive call at this many messages.
pub const MAX_BATCH: u8 = 10;

/// Settings for [`SqsEventQueue`].
#[derive(Debug, Clone)]
pub struct SqsSettings {
    /// CLI executable.
    pub program: String,
    /// Region passed as `--region`; the CLI default applies when `None`.
    pub region: Option<String>,
    /// Queue URL.
    pub queue_url: String,
    /// Messages requested per receive call, at most [`MAX_BATCH`].
    pub max_messages: u8,
    /// Long-poll duration of one receive call.
    pub wait_time: Duration,
    /// How long a received message stays hidden from other consumers.
    ///
    /// Must exceed the longest lifecycle operation, or a slow handler's
    /// event is delivered again while it still runs.
    pub visibility_timeout: Duration,
    /// Upper bound on every CLI call, excluding the long-poll wait.
    pub call_timeout: Duration,
}

impl Default for SqsSettings {
    fn default() -> Self {
        Self {
            program: "aws".to_string(),
            region: None,
            queue_url: String::new(),
            max_messages: MAX_BATCH,
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(3900),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl SqsSettings {
    fn is_fifo(&self) -> bool {
        self.queue_url.ends_with(".fifo")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveOutput {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Message {
    message_id: String,
    receipt_handle: String,
    body: String,
    #[serde(default)]
    attributes: MessageAttributes,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MessageAttributes {
    approximate_receive_count: Option<String>,
}

impl Message {
    /// Receive count reported by the queue; 1 when it is missing.
    fn receive_count(&self) -> u32 {
        self.attributes
            .approximate_receive_count
            .as_deref()
            .and_then(|count| count.parse().ok())
            .unwrap_or(1)
    }
}

/// [`EventQueue`] backed by an SQS queue.
#[derive(Clone)]
pub struct SqsEventQueue {
    settings: SqsSettings,
    cli: Cli,
}

impl std::fmt::Debug for SqsEventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsEventQueue")
            .field("queue_url", &self.settings.queue_url)
            .finish_non_exhaustive()
    }
}

impl SqsEventQueue {
    pub fn new(settings: SqsSettings, runner: Arc<dyn CommandRunner>) -> Self {
        let cli = Cli {
            program: settings.program.clone(),
            region: settings.region.clone(),
            timeout: settings.call_timeout + settings.wait_time,
            runner,
        };
        Self { settings, cli }
    }

    fn deduplication_id(event: &BranchEvent) -> String {
        match &event.delivery_id {
            Some(id) => id.as_str().to_string(),
            None => TraceId::new_random().to_string(),
        }
    }

    /// Deletes a message whose body is not a [`BranchEvent`] so it does not
    /// block the queue.
    async fn discard(&self, message: &Message) {
        if let Err(e) = self.acknowledge(&message.receipt_handle).await {
            warn!(message_id = %message.message_id, error = %e, "Failed to discard unreadable message");
        }
    }
}

fn unavailable(err: BackendError) -> BusError {
    BusError::Unavailable {
        message: err.to_string(),
    }
}

#[async_trait]
impl EventBus for SqsEventQueue {
    #[instrument(skip_all, fields(branch = %event.branch_name, kind = %event.kind))]
    async fn publish(&self, event: BranchEvent) -> Result<(), BusError> {
        let body = serde_json::to_string(&event).map_err(|e| BusError::Unavailable {
            message: format!("failed to encode event: {e}"),
        })?;

        let mut call = args(["sqs", "send-message", "--queue-url"]);
        call.push(self.settings.queue_url.clone());
        call.push("--message-body".to_string());
        call.push(body);
        if self.settings.is_fifo() {
            call.push("--message-group-id".to_string());
            call.push(event.branch_name.to_string());
            call.push("--message-deduplication-id".to_string());
            call.push(Self::deduplication_id(&event));
        }

        self.cli
            .call("sqs send-message", call)
            .await
            .map_err(unavailable)?;
        debug!("Event stored on the queue");
        Ok(())
    }
}

#[async_trait]
impl EventQueue for SqsEventQueue {
    async fn receive(&self) -> Result<Vec<QueuedEvent>, BusError> {
        let mut call = args(["sqs", "receive-message", "--queue-url"]);
        call.push(self.settings.queue_url.clone());
        call.push("--max-number-of-messages".to_string());
        call.push(self.settings.max_messages.clamp(1, MAX_BATCH).to_string());
        call.push("--wait-time-seconds".to_string());
        call.push(self.settings.wait_time.as_secs().to_string());
        call.push("--visibility-timeout".to_string());
        call.push(self.settings.visibility_timeout.as_secs().to_string());
        call.push("--attribute-names".to_string());
        call.push("ApproximateReceiveCount".to_string());
        call.push("--output".to_string());
        call.push("json".to_string());

        let stdout = self
            .cli
            .call("sqs receive-message", call)
            .await
            .map_err(unavailable)?;
        // An empty long poll prints nothing.
        if stdout.is_empty() {
            return Ok(Vec::new());
        }
        let output: ReceiveOutput =
            serde_json::from_str(&stdout).map_err(|e| BusError::Unavailable {
                message: format!("unreadable receive-message output: {e}"),
            })?;

        let mut events = Vec::with_capacity(output.messages.len());
        for message in output.messages {
            match serde_json::from_str::<BranchEvent>(&message.body) {
                Ok(event) => events.push(QueuedEvent {
                    receive_count: message.receive_count(),
                    receipt: message.receipt_handle,
                    event,
                }),
                Err(e) => {
                    warn!(message_id = %message.message_id, error = %e, "Discarding message that is not a branch event");
                    self.discard(&message).await;
                }
            }
        }
        Ok(events)
    }

    async fn acknowledge(&self, receipt: &str) -> Result<(), BusError> {
        let mut call = args(["sqs", "delete-message", "--queue-url"]);
        call.push(self.settings.queue_url.clone());
        call.push("--receipt-handle".to_string());
        call.push(receipt.to_string());
        self.cli
            .call("sqs delete-message", call)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;
