//! Local [`SecretStore`] implementations.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use domain::{ExposeSecret, SecretError, SecretName, SecretStore, SecretString};

/// Environment variable prefix used by [`EnvSecretStore`].
pub const SECRET_ENV_PREFIX: &str = "BRANCHFLEET_SECRET_";

/// Secrets held in process memory.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<SecretName, String>>,
}

impl std::fmt::Debug for InMemorySecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(ToString::to_string)
            .collect();
        f.debug_struct("InMemorySecretStore")
            .field("names", &names)
            .finish()
    }
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name`, replacing any previous value.
    pub fn insert(&self, name: SecretName, value: &SecretString) {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value.expose_secret().to_owned());
    }

    /// Builder-style [`InMemorySecretStore::insert`].
    pub fn with_secret(self, name: SecretName, value: &str) -> Self {
        self.insert(name, &SecretString::new(value.into()));
        self
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(&self, name: &SecretName) -> Result<SecretString, SecretError> {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|v| SecretString::new(v.as_str().into()))
            .ok_or_else(|| SecretError::NotFound { name: name.clone() })
    }
}

/// Reads secrets from environment variables.
///
/// `github-webhook-secret` is read from `BRANCHFLEET_SECRET_GITHUB_WEBHOOK_SECRET`.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    /// Environment variable that holds `name`.
    pub fn variable_for(name: &SecretName) -> String {
        let suffix: String = name
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{SECRET_ENV_PREFIX}{suffix}")
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_secret(&self, name: &SecretName) -> Result<SecretString, SecretError> {
        match std::env::var(Self::variable_for(name)) {
            Ok(value) if !value.is_empty() => Ok(SecretString::new(value.into())),
            Ok(_) | Err(std::env::VarError::NotPresent) => {
                Err(SecretError::NotFound { name: name.clone() })
            }
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::Unavailable {
                name: name.clone(),
                message: "value is not valid unicode".to_string(),
            }),
        }
    }
}

#[cfg(test)]
#[path = "secrets_tests.rs"]
mod tests;
