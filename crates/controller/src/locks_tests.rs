use super::*;
use std::time::Duration;

fn branch(name: &str) -> BranchName {
    BranchName::parse(name).unwrap()
}

#[tokio::test]
async fn test_slot_is_removed_after_release() {
    let locks = BranchLocks::new();
    {
        let guard = locks.acquire(&branch("feat-1")).await;
        assert_eq!(guard.branch().as_str(), "feat-1");
        assert_eq!(locks.active(), 1);
    }
    assert_eq!(locks.active(), 0);
}

#[tokio::test]
async fn test_same_branch_is_exclusive() {
    let locks = Arc::new(BranchLocks::new());
    let b = branch("feat-1");
    let first = locks.acquire(&b).await;

    let waiter = {
        let locks = locks.clone();
        let b = b.clone();
        tokio::spawn(async move {
            let _g = locks.acquire(&b).await;
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(first);
    waiter.await.unwrap();
    assert_eq!(locks.active(), 0);
}

#[tokio::test]
async fn test_different_branches_do_not_contend() {
    let locks = BranchLocks::new();
    let _a = locks.acquire(&branch("feat-1")).await;

    let acquired = tokio::time::timeout(
        Duration::from_millis(100),
        locks.acquire(&branch("feat-2")),
    )
    .await;

    assert!(acquired.is_ok());
}
