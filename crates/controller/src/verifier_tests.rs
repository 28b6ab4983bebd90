use super::*;
use backend::InMemorySecretStore;
use domain::{ErrorKind, SecretString};

const BODY: &[u8] = br#"{"ref":"feat-1","ref_type":"branch"}"#;

fn name() -> SecretName {
    SecretName::new("github-webhook-secret").unwrap()
}

fn verifier(secret: Option<&str>) -> SignatureVerifier {
    let store = match secret {
        Some(value) => InMemorySecretStore::new().with_secret(name(), value),
        None => InMemorySecretStore::new(),
    };
    SignatureVerifier::new(Arc::new(store), name())
}

fn signed(secret: &str) -> String {
    signature::sign(BODY, &SecretString::new(secret.into())).unwrap()
}

#[tokio::test]
async fn test_valid_signature_is_accepted() {
    let v = verifier(Some("hunter2"));
    assert_eq!(v.verify(BODY, Some(&signed("hunter2"))).await, Ok(()));
}

#[tokio::test]
async fn test_wrong_secret_is_an_authentication_failure() {
    let v = verifier(Some("hunter2"));

    let err = v.verify(BODY, Some(&signed("other"))).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
}

#[tokio::test]
async fn test_missing_header_is_an_authentication_failure() {
    let v = verifier(Some("hunter2"));
    let err = v.verify(BODY, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
}

#[tokio::test]
async fn test_missing_secret_rejects_without_leaking_details() {
    let v = verifier(None);

    let err = v.verify(BODY, Some(&signed("hunter2"))).await.unwrap_err();

    assert_eq!(
        err,
        ControllerError::Authentication {
            reason: "webhook secret unavailable".into()
        }
    );
}

#[tokio::test]
async fn test_error_message_never_contains_secret() {
    let v = verifier(Some("hunter2"));

    let err = v.verify(BODY, Some("sha256=00")).await.unwrap_err();

    assert!(!err.to_string().contains("hunter2"));
}
