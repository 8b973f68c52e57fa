//! Redis-backed key-value store
//!
//! Bucket metadata lives in a hash (`<prefix>:buckets`, bucket name → TTL in
//! milliseconds, 0 meaning no expiry). Entries are plain keys
//! `<prefix>:kv:<bucket>:<key>` written with `SET NX PX`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::kv::{BucketConfig, KvBucket, KvError, KvStore};

fn backend(err: redis::RedisError) -> KvError {
    KvError::Backend(err.to_string())
}

/// A bucket stored in redis
pub struct RedisBucket {
    name: String,
    key_prefix: String,
    ttl: Option<Duration>,
    conn: ConnectionManager,
}

impl RedisBucket {
    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl KvBucket for RedisBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value).arg("NX");
        if let Some(ttl) = self.ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }

        let result: Option<String> = cmd.query_async(&mut conn).await.map_err(backend)?;
        match result {
            Some(_) => Ok(()),
            None => Err(KvError::KeyExists(key.to_string())),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

/// Key-value store client for redis
pub struct RedisKv {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisKv {
    /// Connect to redis and check the connection
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, KvError> {
        info!("Connecting to redis key-value store: {}", url);

        let client = redis::Client::open(url).map_err(backend)?;
        let mut conn = client.get_connection_manager().await.map_err(backend)?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn registry_key(&self) -> String {
        format!("{}:buckets", self.prefix)
    }

    fn bucket(&self, name: &str, ttl_ms: u64) -> Arc<dyn KvBucket> {
        Arc::new(RedisBucket {
            name: name.to_string(),
            key_prefix: format!("{}:kv:{}:", self.prefix, name),
            ttl: (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms)),
            conn: self.conn.clone(),
        })
    }

    async fn bucket_ttl(&self, name: &str) -> Result<Option<u64>, KvError> {
        let mut conn = self.conn.clone();
        redis::cmd("HGET")
            .arg(self.registry_key())
            .arg(name)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get_or_create_bucket(
        &self,
        config: BucketConfig,
    ) -> Result<Arc<dyn KvBucket>, KvError> {
        if let Some(ttl_ms) = self.bucket_ttl(&config.name).await? {
            return Ok(self.bucket(&config.name, ttl_ms));
        }

        let ttl_ms = config.ttl.map(|t| t.as_millis() as u64).unwrap_or(0);
        let mut conn = self.conn.clone();
        // HSETNX keeps the first writer's TTL when two nodes race
        let _: i64 = redis::cmd("HSETNX")
            .arg(self.registry_key())
            .arg(&config.name)
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        debug!("Created bucket {} (ttl {}ms)", config.name, ttl_ms);
        let ttl_ms = self.bucket_ttl(&config.name).await?.unwrap_or(ttl_ms);
        Ok(self.bucket(&config.name, ttl_ms))
    }

    async fn get_bucket(&self, name: &str) -> Result<Arc<dyn KvBucket>, KvError> {
        match self.bucket_ttl(name).await? {
            Some(ttl_ms) => Ok(self.bucket(name, ttl_ms)),
            None => Err(KvError::BucketNotFound(name.to_string())),
        }
    }

    async fn list_buckets(&self) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = redis::cmd("HKEYS")
            .arg(self.registry_key())
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        names.sort();
        Ok(names)
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), KvError> {
        if self.bucket_ttl(name).await?.is_none() {
            return Err(KvError::BucketNotFound(name.to_string()));
        }

        let mut conn = self.conn.clone();
        let pattern = format!("{}:kv:{}:*", self.prefix, name);
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        for chunk in keys.chunks(100) {
            let _: i64 = redis::cmd("DEL")
                .arg(chunk)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
        }

        let _: i64 = redis::cmd("HDEL")
            .arg(self.registry_key())
            .arg(name)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        info!("Deleted bucket {} ({} keys)", name, keys.len());
        Ok(())
    }
}
