//! In-process key-value store

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::kv::{BucketConfig, KvBucket, KvError, KvStore};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(true)
    }
}

/// A bucket held in memory
pub struct MemoryBucket {
    name: String,
    ttl: Option<Duration>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryBucket {
    fn new(config: BucketConfig) -> Self {
        Self {
            name: config.name,
            ttl: config.ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl KvBucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.get(key).map(|e| e.is_live(now)).unwrap_or(false) {
            return Err(KvError::KeyExists(key.to_string()));
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: self.ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

/// Key-value store living in the current process
#[derive(Default)]
pub struct MemoryKv {
    buckets: Mutex<HashMap<String, Arc<MemoryBucket>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get_or_create_bucket(
        &self,
        config: BucketConfig,
    ) -> Result<Arc<dyn KvBucket>, KvError> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(config.name.clone())
            .or_insert_with(|| Arc::new(MemoryBucket::new(config)))
            .clone();
        Ok(bucket)
    }

    async fn get_bucket(&self, name: &str) -> Result<Arc<dyn KvBucket>, KvError> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        match buckets.get(name) {
            Some(bucket) => Ok(bucket.clone()),
            None => Err(KvError::BucketNotFound(name.to_string())),
        }
    }

    async fn list_buckets(&self) -> Result<Vec<String>, KvError> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = buckets.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), KvError> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KvError::BucketNotFound(name.to_string()))
    }
}
