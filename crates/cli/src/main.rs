//! Branchfleet entry point.
//!
//! This binary is the composition root. It loads [`config::Settings`],
//! installs the tracing subscriber, builds the concrete adapters in [`app`],
//! and dispatches to a subcommand in [`commands`].

mod app;
mod commands;
mod config;
mod reissue;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::telemetry::TelemetryBuilder;

/// Per-branch pipeline lifecycle controller.
#[derive(Debug, Parser)]
#[command(name = "branchfleet", version, about)]
struct Cli {
    /// TOML configuration file. Defaults to `branchfleet.toml` when present.
    #[arg(long, global = true, env = "BRANCHFLEET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Receive webhooks and provision or tear down branch pipelines.
    Serve,
    /// Resolve the primary branch once and print the result.
    ResolveBranch,
    /// Ask the running instance to provision the pipeline for a branch.
    CreateBranch {
        name: String,
        /// Webhook URL of the running instance. Defaults to
        /// `server.public_url`, then to the local listener.
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Ask the running instance to tear down the pipeline for a branch.
    DeleteBranch {
        name: String,
        /// Webhook URL of the running instance.
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Print the backend's view of a branch pipeline.
    Status { name: String },
    /// Print the signature header value for a payload file.
    Sign {
        #[arg(long)]
        payload: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;
    settings.validate()?;
    let _telemetry = TelemetryBuilder::from_settings(&settings.telemetry).init()?;

    match cli.command {
        Command::Serve => commands::serve(&settings).await,
        Command::ResolveBranch => commands::resolve_branch(&settings).await,
        Command::CreateBranch { name, endpoint } => {
            commands::create_branch(&settings, &name, endpoint.as_deref()).await
        }
        Command::DeleteBranch { name, endpoint } => {
            commands::delete_branch(&settings, &name, endpoint.as_deref()).await
        }
        Command::Status { name } => commands::status(&settings, &name).await,
        Command::Sign { payload } => commands::sign(&settings, &payload).await,
    }
}
