//! Named deployment locks.
//!
//! At most one update pipeline runs per deployment name. Locks for
//! different names never contend. The handle releases the lock on drop,
//! which covers error and panic unwinds as well as the success path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {wait:?} waiting for deployment lock '{name}'")]
    Timeout { name: String, wait: Duration },
}

/// Registry of per-deployment mutual-exclusion locks.
///
/// Cheap to clone; all clones share the same lock table.
#[derive(Clone, Default)]
pub struct DeploymentLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

/// RAII guard for a held deployment lock.
pub struct DeploymentLockHandle {
    name: String,
    _permit: OwnedSemaphorePermit,
}

impl DeploymentLockHandle {
    /// Deployment name this handle locks.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DeploymentLockHandle {
    fn drop(&mut self) {
        debug!(deployment = %self.name, "deployment lock released");
    }
}

impl DeploymentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `name`, waiting at most `wait`.
    ///
    /// Returns a scoped handle; dropping it releases the lock.
    pub async fn acquire(
        &self,
        name: &str,
        wait: Duration,
    ) -> Result<DeploymentLockHandle, LockError> {
        let sem = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        // The semaphore is never closed, so a failed acquire can only mean
        // the wait elapsed.
        let permit = match tokio::time::timeout(wait, sem.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    wait,
                });
            }
        };

        debug!(deployment = %name, "deployment lock acquired");
        Ok(DeploymentLockHandle {
            name: name.to_string(),
            _permit: permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn same_name_is_exclusive() {
        let locks = DeploymentLocks::new();
        let held = locks.acquire("prod", SHORT).await.unwrap();
        assert_eq!(held.name(), "prod");

        let second = locks.acquire("prod", SHORT).await;
        assert!(matches!(second, Err(LockError::Timeout { .. })));

        drop(held);
        locks.acquire("prod", SHORT).await.unwrap();
    }

    #[tokio::test]
    async fn different_names_do_not_contend() {
        let locks = DeploymentLocks::new();
        let _a = locks.acquire("prod", SHORT).await.unwrap();
        let _b = locks.acquire("staging", SHORT).await.unwrap();
    }

    #[tokio::test]
    async fn waiting_acquire_succeeds_once_released() {
        let locks = DeploymentLocks::new();
        let held = locks.acquire("prod", SHORT).await.unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2.acquire("prod", Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        let handle = waiter.await.unwrap();
        assert!(handle.is_ok());
    }

    #[tokio::test]
    async fn panicking_holder_frees_the_lock() {
        let locks = DeploymentLocks::new();

        let locks2 = locks.clone();
        let task = tokio::spawn(async move {
            let _held = locks2.acquire("prod", SHORT).await.unwrap();
            panic!("pipeline blew up");
        });
        assert!(task.await.is_err());

        locks.acquire("prod", SHORT).await.unwrap();
    }
}
