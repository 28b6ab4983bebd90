use super::*;

#[test]
fn test_branch_name_accepts_typical_feature_branch() {
    let name = BranchName::parse("user-feature-123").unwrap();
    assert_eq!(name.as_str(), "user-feature-123");
    assert_eq!(name.to_string(), "user-feature-123");
}

#[test]
fn test_branch_name_rejects_empty() {
    assert_eq!(BranchName::parse(""), Err(BranchNameError::Empty));
}

#[test]
fn test_branch_name_too_long_is_reported_before_character_errors() {
    let long = format!("feature/abc{}", "x".repeat(MAX_BRANCH_NAME_LEN));
    let len = long.chars().count();

    assert_eq!(
        BranchName::parse(long),
        Err(BranchNameError::TooLong {
            len,
            max: MAX_BRANCH_NAME_LEN
        })
    );
}

#[test]
fn test_branch_name_at_limit_is_accepted() {
    let name = format!("a{}", "b".repeat(MAX_BRANCH_NAME_LEN - 1));
    assert!(BranchName::parse(name).is_ok());
}

#[test]
fn test_branch_name_rejects_slash_without_rewriting() {
    assert_eq!(
        BranchName::parse("feature/abc"),
        Err(BranchNameError::InvalidCharacter {
            found: '/',
            position: 7
        })
    );
}

#[test]
fn test_branch_name_must_start_with_letter() {
    assert_eq!(
        BranchName::parse("1-hotfix"),
        Err(BranchNameError::InvalidStart { found: '1' })
    );
    assert_eq!(
        BranchName::parse("-hotfix"),
        Err(BranchNameError::InvalidStart { found: '-' })
    );
}

#[test]
fn test_branch_name_deserialization_validates() {
    let ok: Result<BranchName, _> = serde_json::from_str("\"main\"");
    assert!(ok.is_ok());

    let bad: Result<BranchName, _> = serde_json::from_str("\"release_1\"");
    assert!(bad.is_err());
}

#[test]
fn test_repository_id_parses_owner_and_name() {
    let repo = RepositoryId::parse("octo-org/widgets").unwrap();
    assert_eq!(repo.owner(), "octo-org");
    assert_eq!(repo.name(), "widgets");
    assert_eq!(repo.to_string(), "octo-org/widgets");
}

#[test]
fn test_repository_id_rejects_malformed_values() {
    for value in ["widgets", "/widgets", "octo-org/", "a/b/c", ""] {
        assert!(RepositoryId::parse(value).is_err(), "{value} should fail");
    }
}

#[test]
fn test_repository_id_matching_is_case_insensitive() {
    let repo = RepositoryId::parse("Octo-Org/Widgets").unwrap();
    assert!(repo.matches("octo-org/widgets"));
    assert!(!repo.matches("octo-org/gadgets"));
    assert!(!repo.matches("widgets"));
}

#[test]
fn test_string_ids_reject_empty_values() {
    assert!(SecretName::new("").is_none());
    assert_eq!(
        DeliveryId::new("72d3162e").map(|d| d.to_string()),
        Some("72d3162e".to_string())
    );
}

#[test]
fn test_trace_id_reuses_delivery_id() {
    let delivery = DeliveryId::new("abc-123").unwrap();
    assert_eq!(TraceId::from_delivery(&delivery).as_str(), "abc-123");
    assert_ne!(TraceId::new_random(), TraceId::new_random());
}
