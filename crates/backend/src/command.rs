//! Subprocess execution seam.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// Captured result of one subprocess run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    /// Captured standard output, lossily decoded.
    pub stdout: String,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the process exited with status 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a program to completion and captures its output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`.
    ///
    /// A non-zero exit is reported through [`CommandOutput::status`], not as
    /// an `Err`; `Err` means the process could not be spawned at all.
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
///
/// The child is killed if the returned future is dropped, so an outer
/// timeout never leaves a stray process behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
