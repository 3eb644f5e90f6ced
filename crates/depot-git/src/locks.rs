//! Per-repository ref-update serialization

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per repository, created on first use.
///
/// receive-pack holds the guard while it checks and moves refs, so two
/// pushes to the same repository cannot interleave their compare-and-swap
/// steps within this process.
#[derive(Debug, Default)]
pub struct RefLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RefLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of `repo`.
    pub async fn lock(&self, repo: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(repo.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Number of repositories with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_repo_serializes() {
        let locks = Arc::new(RefLocks::new());
        let guard = locks.lock("repos/1/a.git").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("repos/1/a.git").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should get the lock")
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_repos_do_not_block() {
        let locks = RefLocks::new();
        let _a = locks.lock("repos/1/a.git").await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.lock("repos/1/b.git"))
            .await
            .expect("other repository must not block");
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let locks = RefLocks::new();
        drop(locks.lock("repos/1/a.git").await);
        drop(locks.lock("repos/1/b.git").await);
        assert_eq!(locks.len(), 1);
    }
}
