//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example,
//! a [`SecretName`] with a [`TemplateRef`] even though both are strings under the
//! hood.
//!
//! [`BranchName`] and [`RepositoryId`] carry real invariants and are only
//! constructed through their validating `parse` functions.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Branch names
// ---------------------------------------------------------------------------

/// Maximum length of a branch name that can back a per-branch pipeline.
///
/// Stack names and build project names are derived from the branch name plus
/// fixed prefixes and suffixes; 64 keeps every derived name within the
/// backend's own limits.
pub const MAX_BRANCH_NAME_LEN: usize = 64;

/// Reasons a branch name cannot be used as a pipeline resource discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum BranchNameError {
    /// The name is the empty string.
    #[error("branch name is empty")]
    Empty,

    /// The name exceeds [`MAX_BRANCH_NAME_LEN`].
    #[error("branch name is {len} characters long; the limit is {max}")]
    TooLong {
        /// Length of the rejected name, in characters.
        len: usize,
        /// The configured limit.
        max: usize,
    },

    /// The first character is not an ASCII letter.
    #[error("branch name must start with an ASCII letter, found {found:?}")]
    InvalidStart {
        /// The offending first character.
        found: char,
    },

    /// A character outside `[A-Za-z0-9-]` was found.
    #[error("branch name contains {found:?} at position {position}; only ASCII letters, digits and '-' are allowed")]
    InvalidCharacter {
        /// The offending character.
        found: char,
        /// Zero-based character index.
        position: usize,
    },
}

/// A Git branch name that satisfies pipeline naming constraints.
///
/// The name is the identity key of a [`crate::BranchPipelineResource`]: at
/// most one pipeline exists per name. Names are validated, never truncated
/// or rewritten; a branch that cannot be represented is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchName(String);

impl BranchName {
    /// Validates `value` against the naming constraints.
    ///
    /// Length is checked before the character set so that over-long names
    /// always report [`BranchNameError::TooLong`].
    pub fn parse(value: impl Into<String>) -> Result<Self, BranchNameError> {
        let value = value.into();
        let len = value.chars().count();
        if len == 0 {
            return Err(BranchNameError::Empty);
        }
        if len > MAX_BRANCH_NAME_LEN {
            return Err(BranchNameError::TooLong {
                len,
                max: MAX_BRANCH_NAME_LEN,
            });
        }

        let mut chars = value.chars().enumerate();
        if let Some((_, first)) = chars.next() {
            if !first.is_ascii_alphabetic() {
                return Err(BranchNameError::InvalidStart { found: first });
            }
        }
        if let Some((position, found)) =
            chars.find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '-'))
        {
            return Err(BranchNameError::InvalidCharacter { found, position });
        }

        Ok(Self(value))
    }

    /// Returns the branch name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BranchName {
    type Error = BranchNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<BranchName> for String {
    fn from(value: BranchName) -> Self {
        value.0
    }
}

impl std::fmt::Display for BranchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Repository identity
// ---------------------------------------------------------------------------

/// Error returned when a repository identity is not in `owner/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("repository identity {value:?} is not in 'owner/name' form")]
pub struct RepositoryIdError {
    /// The rejected input.
    pub value: String,
}

/// Identifies the single source repository a controller instance is bound to.
///
/// Stored as an `owner` / `name` pair. Comparison with identities taken from
/// webhook payloads is ASCII case-insensitive, matching how the provider
/// resolves repository names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryId {
    owner: String,
    name: String,
}

impl RepositoryId {
    /// Parses an `"owner/name"` string.
    pub fn parse(full_name: &str) -> Result<Self, RepositoryIdError> {
        let err = || RepositoryIdError {
            value: full_name.to_string(),
        };
        let (owner, name) = full_name.split_once('/').ok_or_else(err)?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(err());
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Returns the repository owner (user or organisation).
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the repository name without the owner.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if `full_name` refers to this repository.
    pub fn matches(&self, full_name: &str) -> bool {
        match full_name.split_once('/') {
            Some((owner, name)) => {
                owner.eq_ignore_ascii_case(&self.owner) && name.eq_ignore_ascii_case(&self.name)
            }
            None => false,
        }
    }
}

impl std::fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Correlates one inbound webhook request across logs and the HTTP response.
///
/// Taken from the delivery id when the provider supplies one; generated
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(String);

impl TraceId {
    /// Generates a new random trace identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Reuses a provider delivery id as the trace identifier.
    pub fn from_delivery(id: &DeliveryId) -> Self {
        Self(id.as_str().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed (provider / backend names)
// ---------------------------------------------------------------------------

string_id! {
    /// Provider-assigned identifier of a single webhook delivery
    /// (`X-GitHub-Delivery`). Used for de-duplication of redeliveries.
    DeliveryId
}

string_id! {
    /// Name of a secret in the secret store (e.g. `"github-webhook-secret"`).
    SecretName
}

string_id! {
    /// Reference to the infrastructure template the managed pipeline service
    /// materialises for each branch.
    TemplateRef
}

string_id! {
    /// Reference to the externally managed build job that produces a branch's
    /// deployable artifact (e.g. a build project name).
    BuildJobRef
}

string_id! {
    /// Handle returned by the managed pipeline service when it accepts a stack
    /// creation request (e.g. a build run id).
    StackHandle
}

#[cfg(test)]
#[path = "identifiers_tests.rs"]
mod tests;
