//! Branchfleet GitHub infrastructure adapter.
//!
//! Implements [`domain::RepositoryMetadata`] over the GitHub REST API
//! (`GET /repos/{owner}/{repo}`).
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules.
//! HTTP status codes, rate-limit headers and authentication details are
//! classified here into [`domain::MetadataError`]; the controller never sees
//! them.

pub mod client;

pub use client::{GithubClient, GithubSettings};
