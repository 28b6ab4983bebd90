//! Transport-independent webhook processing.

use std::sync::Arc;

use axum::http::HeaderMap;
use controller::SignatureVerifier;
use domain::{
    ControllerError, DeliveryId, EventBus, EventNormalizer, Normalized, Timestamp, TraceId,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

/// Outcome of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookResponse {
    /// Queued for a handler.
    Accepted { trace_id: TraceId },
    /// Authenticated, intentionally dropped.
    Ignored { trace_id: TraceId },
    /// Authentication failed.
    Unauthorized { trace_id: TraceId },
    /// The payload cannot be used; `reason` is a machine-readable code.
    Rejected {
        trace_id: TraceId,
        reason: &'static str,
    },
    /// The bus refused the event.
    InternalError { trace_id: TraceId },
}

/// JSON body sent with every response.
#[derive(Debug, Serialize)]
pub struct ResponseBody<'a> {
    pub status: &'static str,
    pub trace_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl WebhookResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Accepted { .. } | Self::Ignored { .. } => 200,
            Self::Unauthorized { .. } => 401,
            Self::Rejected { .. } => 400,
            Self::InternalError { .. } => 500,
        }
    }

    pub fn trace_id(&self) -> &TraceId {
        match self {
            Self::Accepted { trace_id }
            | Self::Ignored { trace_id }
            | Self::Unauthorized { trace_id }
            | Self::Rejected { trace_id, .. }
            | Self::InternalError { trace_id } => trace_id,
        }
    }

    pub fn body(&self) -> ResponseBody<'_> {
        let (status, reason) = match self {
            Self::Accepted { .. } => ("accepted", None),
            Self::Ignored { .. } => ("ignored", None),
            Self::Unauthorized { .. } => ("unauthorized", None),
            Self::Rejected { reason, .. } => ("rejected", Some(*reason)),
            Self::InternalError { .. } => ("error", None),
        };
        ResponseBody {
            status,
            trace_id: self.trace_id().as_str(),
            reason,
        }
    }
}

/// Authenticates, normalises and publishes webhook deliveries.
pub struct WebhookReceiver {
    verifier: SignatureVerifier,
    normalizer: EventNormalizer,
    bus: Arc<dyn EventBus>,
}

impl std::fmt::Debug for WebhookReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookReceiver")
            .field("verifier", &self.verifier)
            .field("normalizer", &self.normalizer)
            .finish_non_exhaustive()
    }
}

impl WebhookReceiver {
    pub fn new(
        verifier: SignatureVerifier,
        normalizer: EventNormalizer,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            verifier,
            normalizer,
            bus,
        }
    }

    /// Processes one delivery. The body must be the exact bytes received.
    pub async fn receive(&self, headers: &HeaderMap, body: &[u8]) -> WebhookResponse {
        let delivery_id = header(headers, DELIVERY_HEADER).and_then(DeliveryId::new);
        let trace_id = delivery_id
            .as_ref()
            .map(TraceId::from_delivery)
            .unwrap_or_else(TraceId::new_random);
        let event_type = header(headers, EVENT_HEADER);

        if let Err(e) = self
            .verifier
            .verify(body, header(headers, SIGNATURE_HEADER))
            .await
        {
            warn!(%trace_id, event_type, reason_code = e.reason_code(), error = %e, "Rejected webhook delivery");
            return WebhookResponse::Unauthorized { trace_id };
        }

        let Some(event_type) = event_type else {
            warn!(%trace_id, "Webhook delivery has no event type header");
            return WebhookResponse::Rejected {
                trace_id,
                reason: domain::ErrorKind::ValidationFailure.reason_code(),
            };
        };

        let event = match self
            .normalizer
            .normalize(event_type, body, delivery_id, Timestamp::now())
        {
            Ok(Normalized::Event(event)) => event,
            Ok(Normalized::Ignored(reason)) => {
                debug!(%trace_id, event_type, %reason, "Ignored webhook delivery");
                return WebhookResponse::Ignored { trace_id };
            }
            Err(e) => {
                let err = ControllerError::from(e);
                warn!(%trace_id, event_type, reason_code = err.reason_code(), error = %err, "Rejected webhook payload");
                return WebhookResponse::Rejected {
                    trace_id,
                    reason: err.reason_code(),
                };
            }
        };

        let (kind, branch) = (event.kind, event.branch_name.clone());
        match self.bus.publish(event).await {
            Ok(()) => {
                info!(%trace_id, %kind, %branch, "Branch event queued");
                WebhookResponse::Accepted { trace_id }
            }
            Err(e) => {
                error!(%trace_id, %kind, %branch, error = %e, "Event bus refused branch event");
                WebhookResponse::InternalError { trace_id }
            }
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
#[path = "webhook_tests.rs"]
mod tests;
