//! Branchfleet backend adapters.
//!
//! Implements the [`domain::StackService`], [`domain::BuildJobService`],
//! [`domain::SecretStore`] and [`domain::EventQueue`] traits.
//!
//! ## Adapters
//!
//! | Type | Backing | Used by |
//! |------|---------|---------|
//! | [`InMemoryBackend`] | process memory, simulated asynchronous settling | tests, `--backend memory` |
//! | [`AwsCliBackend`] | `aws codebuild` / `aws cloudformation` / `aws s3` subprocesses | production |
//! | [`InMemorySecretStore`] | process memory | tests |
//! | [`EnvSecretStore`] | process environment | local development |
//! | [`AwsSecretsManager`] | `aws secretsmanager` subprocess | production |
//! | [`SqsEventQueue`] | `aws sqs` subprocess | production event queue |
//!
//! Subprocesses are spawned through the [`CommandRunner`] trait so the AWS
//! adapters can be exercised without the CLI installed.

pub mod aws;
pub mod command;
pub mod memory;
pub mod secrets;
pub mod sqs;

pub use aws::{AwsCliBackend, AwsCliSettings, AwsSecretsManager};
pub use command::{CommandOutput, CommandRunner, TokioCommandRunner};
pub use memory::{BackendCall, InMemoryBackend, Operation};
pub use secrets::{EnvSecretStore, InMemorySecretStore};
pub use sqs::{SqsEventQueue, SqsSettings};
