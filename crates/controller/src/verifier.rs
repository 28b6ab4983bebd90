//! Signature Verifier bound to a secret store.

use std::sync::Arc;

use domain::{signature, ControllerError, SecretName, SecretStore};
use tracing::warn;

/// Authenticates webhook payloads with the secret stored under one name.
pub struct SignatureVerifier {
    secrets: Arc<dyn SecretStore>,
    secret_name: SecretName,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret_name", &self.secret_name)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secrets: Arc<dyn SecretStore>, secret_name: SecretName) -> Self {
        Self {
            secrets,
            secret_name,
        }
    }

    /// Verifies `claimed` against the raw `body`.
    ///
    /// An unreadable secret rejects the request exactly like a bad signature.
    pub async fn verify(&self, body: &[u8], claimed: Option<&str>) -> Result<(), ControllerError> {
        let secret = self.secrets.get_secret(&self.secret_name).await.map_err(|e| {
            warn!(error = %e, "Webhook secret could not be read");
            ControllerError::Authentication {
                reason: "webhook secret unavailable".to_string(),
            }
        })?;

        signature::verify(body, claimed, &secret).map_err(|e| ControllerError::Authentication {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
#[path = "verifier_tests.rs"]
mod tests;
