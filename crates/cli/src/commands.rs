//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use domain::{signature, BranchName, EventKind, ResolutionSource, SecretStore};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use crate::app;
use crate::config::Settings;
use crate::reissue::ReissueClient;

/// Runs the ingestion endpoint until SIGINT/SIGTERM, then drains queued
/// lifecycle work.
pub async fn serve(settings: &Settings) -> Result<()> {
    let secrets = app::secret_store(settings);

    let resolved = app::branch_resolver(settings, secrets.clone())?
        .resolve_branch(&settings.repository()?, &settings.credentials()?)
        .await
        .context("Primary branch resolution failed")?;
    for warning in &resolved.warnings {
        warn!(warning = %warning, "Primary branch resolution degraded");
    }
    info!(branch = %resolved.branch, source = ?resolved.source, "Primary branch resolved");

    let backends = app::backends(settings);
    let controller = app::lifecycle_controller(settings, &backends)?;
    let dispatcher = app::Dispatcher::start(settings, controller)?;

    let receiver = Arc::new(app::webhook_receiver(
        settings,
        secrets,
        dispatcher.bus.clone(),
    )?);
    let router = listener::router(receiver, &app::listener_settings(settings));

    let tcp = TcpListener::bind(&settings.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", settings.server.bind))?;
    let served = listener::serve(tcp, router, shutdown_signal())
        .await
        .context("Webhook listener failed");

    info!("Draining in-flight branch events");
    dispatcher.drain().await;
    served
}

/// Runs the resolution chain once and prints the result.
pub async fn resolve_branch(settings: &Settings) -> Result<()> {
    let secrets = app::secret_store(settings);
    let result = app::branch_resolver(settings, secrets)?
        .resolve_branch(&settings.repository()?, &settings.credentials()?)
        .await
        .context("Primary branch resolution failed")?;
    if result.source == ResolutionSource::Fallback {
        warn!(branch = %result.branch, "Using the configured fallback branch");
    }
    print_json(&result)
}

/// Asks the running instance to provision the pipeline for `name`.
pub async fn create_branch(settings: &Settings, name: &str, endpoint: Option<&str>) -> Result<()> {
    reissue(settings, EventKind::Created, name, endpoint).await
}

/// Asks the running instance to tear down the pipeline for `name`.
pub async fn delete_branch(settings: &Settings, name: &str, endpoint: Option<&str>) -> Result<()> {
    reissue(settings, EventKind::Deleted, name, endpoint).await
}

async fn reissue(
    settings: &Settings,
    kind: EventKind,
    name: &str,
    endpoint: Option<&str>,
) -> Result<()> {
    let branch = BranchName::parse(name)
        .with_context(|| format!("'{name}' is not a usable branch name"))?;
    let url = match endpoint {
        Some(url) => url.to_string(),
        None => settings.reissue_url(),
    };
    let secret_name = settings.webhook_secret()?;
    let secret = app::secret_store(settings)
        .get_secret(&secret_name)
        .await
        .with_context(|| format!("Failed to read secret '{secret_name}'"))?;

    let receipt = ReissueClient::new(url, secret, settings.repository()?, settings.call_timeout())?
        .send(kind, &branch)
        .await?;
    print_json(&receipt)
}

pub async fn status(settings: &Settings, name: &str) -> Result<()> {
    let controller = app::lifecycle_controller(settings, &app::backends(settings))?;
    let resource = controller
        .describe(name)
        .await
        .with_context(|| format!("Reading the state of '{name}' failed"))?;
    print_json(&resource)
}

/// Prints the `X-Hub-Signature-256` value for the payload at `path`.
pub async fn sign(settings: &Settings, path: &Path) -> Result<()> {
    let payload =
        tokio::fs::read(path).await.with_context(|| format!("Failed to read {}", path.display()))?;
    let name = settings.webhook_secret()?;
    let secret = app::secret_store(settings)
        .get_secret(&name)
        .await
        .with_context(|| format!("Failed to read secret '{name}'"))?;
    println!("{}", signature::sign(&payload, &secret)?);
    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
