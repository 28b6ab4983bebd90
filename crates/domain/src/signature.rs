//! HMAC-SHA256 webhook signatures.
//!
//! The digest is always computed over the exact raw request bytes; a payload
//! that was parsed and re-serialised may differ byte-for-byte and must never
//! be verified. Comparison is constant-time via [`Mac::verify_slice`].
//!
//! Header format: `sha256=<lowercase hex digest>`.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Why a payload signature was rejected.
///
/// None of the variants carry the secret or the expected digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// No signature header was sent.
    #[error("signature header missing")]
    MissingHeader,

    /// The header does not start with `sha256=`.
    #[error("signature header is not a sha256 signature")]
    UnsupportedScheme,

    /// The digest is not valid hex.
    #[error("signature digest is not valid hex")]
    MalformedDigest,

    /// The digest does not match the payload.
    #[error("signature mismatch")]
    Mismatch,

    /// The configured secret is empty.
    #[error("webhook secret is empty")]
    EmptySecret,
}

fn mac_for(secret: &SecretString) -> Result<HmacSha256, SignatureError> {
    let key = secret.expose_secret().as_bytes();
    if key.is_empty() {
        return Err(SignatureError::EmptySecret);
    }
    HmacSha256::new_from_slice(key).map_err(|_| SignatureError::EmptySecret)
}

/// Computes the signature header value for `payload`.
pub fn sign(payload: &[u8], secret: &SecretString) -> Result<String, SignatureError> {
    let mut mac = mac_for(secret)?;
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(digest)))
}

/// Verifies `claimed` against the signature of `payload` under `secret`.
pub fn verify(
    payload: &[u8],
    claimed: Option<&str>,
    secret: &SecretString,
) -> Result<(), SignatureError> {
    let claimed = claimed.ok_or(SignatureError::MissingHeader)?;
    let digest_hex = claimed
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::UnsupportedScheme)?;
    let digest = hex::decode(digest_hex).map_err(|_| SignatureError::MalformedDigest)?;

    let mut mac = mac_for(secret)?;
    mac.update(payload);
    mac.verify_slice(&digest)
        .map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;
