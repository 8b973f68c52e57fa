//! Distributed lock on top of a TTL key-value bucket
//!
//! Each lock key owns a bucket `locks-<key>` whose TTL equals the lock
//! timeout, so a holder that dies without unlocking releases the lock once
//! the TTL runs out. Waiters poll; there is no fairness between them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::kv::{BucketConfig, KvBucket, KvError, KvStore};
use crate::utils::wait_for;

/// Delay between two acquisition attempts
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Mutual exclusion over a named key
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    key: String,
    timeout: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KvStore>, key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            timeout,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Name of the bucket backing this lock
    pub fn bucket(&self) -> String {
        format!("locks-{}", self.key)
    }

    async fn open_bucket(&self) -> Result<Arc<dyn KvBucket>, OrchestratorError> {
        let config = BucketConfig::new(self.bucket()).with_ttl(self.timeout);
        Ok(self.store.get_or_create_bucket(config).await?)
    }

    /// Acquire the lock, waiting at most the lock timeout
    pub async fn lock(&self) -> Result<(), OrchestratorError> {
        let bucket = self.open_bucket().await?;

        let value = chrono::Utc::now().to_rfc3339();
        let acquired = wait_for(self.timeout, LOCK_POLL_INTERVAL, || {
            let bucket = bucket.clone();
            let value = value.clone();
            let key = self.key.clone();
            async move {
                match bucket.create(&key, value.as_bytes()).await {
                    Ok(()) => Some(()),
                    Err(KvError::KeyExists(_)) => None,
                    Err(e) => {
                        debug!("Lock {} attempt failed: {}", key, e);
                        None
                    }
                }
            }
        })
        .await;

        match acquired {
            Some(()) => {
                info!("Acquired lock: {}", self.key);
                Ok(())
            }
            None => Err(OrchestratorError::LockTimeout(self.key.clone())),
        }
    }

    /// Acquire the lock only if it is free right now. Returns whether it
    /// was acquired.
    pub async fn try_lock(&self) -> Result<bool, OrchestratorError> {
        let bucket = self.open_bucket().await?;
        let value = chrono::Utc::now().to_rfc3339();
        match bucket.create(&self.key, value.as_bytes()).await {
            Ok(()) => {
                info!("Acquired lock: {}", self.key);
                Ok(true)
            }
            Err(KvError::KeyExists(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock
    pub async fn unlock(&self) -> Result<(), OrchestratorError> {
        let bucket = self.store.get_bucket(&self.bucket()).await?;
        bucket.delete(&self.key).await?;
        info!("Released lock: {}", self.key);
        Ok(())
    }
}
