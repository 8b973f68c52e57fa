//! TTL key-value store abstraction
//!
//! Buckets group keys under a common time-to-live. The lock implementation
//! only relies on the atomic `create` of a bucket, the rest is used by debug
//! tooling.

pub mod lock;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Key-value store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("key already exists: {0}")]
    KeyExists(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Bucket configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    pub name: String,

    /// Maximum age of every entry, `None` keeps entries forever
    pub ttl: Option<Duration>,
}

impl BucketConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A named group of keys
#[async_trait]
pub trait KvBucket: Send + Sync {
    fn name(&self) -> &str;

    /// Create `key` only if it does not exist yet
    async fn create(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

/// Key-value store client
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Open a bucket, creating it with `config` when missing
    async fn get_or_create_bucket(
        &self,
        config: BucketConfig,
    ) -> Result<Arc<dyn KvBucket>, KvError>;

    /// Open an existing bucket
    async fn get_bucket(&self, name: &str) -> Result<Arc<dyn KvBucket>, KvError>;

    async fn list_buckets(&self) -> Result<Vec<String>, KvError>;

    async fn delete_bucket(&self, name: &str) -> Result<(), KvError>;
}
