//! axum wiring for [`WebhookReceiver`].

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::webhook::{WebhookReceiver, WebhookResponse};

/// HTTP settings for the ingestion endpoint.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Path webhook deliveries are POSTed to.
    pub webhook_path: String,
    /// Largest accepted request body, in bytes.
    pub body_limit: usize,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            webhook_path: "/webhook".to_string(),
            // GitHub caps webhook payloads at 25 MB.
            body_limit: 25 * 1024 * 1024,
        }
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body())).into_response()
    }
}

/// Builds the ingestion router: `POST <webhook_path>` and `GET /health`.
pub fn router(receiver: Arc<WebhookReceiver>, settings: &ListenerSettings) -> Router {
    Router::new()
        .route(&settings.webhook_path, post(receive_webhook))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(settings.body_limit))
        .with_state(receiver)
}

async fn receive_webhook(
    State(receiver): State<Arc<WebhookReceiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receiver.receive(&headers, &body).await.into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Serves `app` on `listener` until `shutdown` resolves, then finishes
/// in-flight requests.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Webhook listener started");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Webhook listener stopped");
    Ok(())
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
