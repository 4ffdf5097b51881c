//! Redis-backed session storage.
//!
//! Records live under `ssh_session:<id>` as JSON with a native TTL, so Redis
//! expires them on its own even if this process dies. The periodic sweep still
//! scans for records idle past the TTL as a belt-and-braces cleanup (the
//! `last_accessed_ms` field can lag the key TTL when `touch` partially fails).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::sleep;
use tracing::warn;

use crate::error::Error;
use crate::store::backend::{SessionBackend, SessionRecord};
use crate::store::now_ms;

const KEY_PREFIX: &str = "ssh_session:";

fn key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

fn storage_err(e: &redis::RedisError) -> Error {
    Error::StorageUnavailable(e.to_string())
}

/// Session backend over a Redis connection manager (auto-reconnecting).
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect with bounded retries and capped exponential backoff.
    ///
    /// Returns `StorageUnavailable` after `attempts` failures; the caller
    /// decides whether to degrade to the in-memory store or hard-fail.
    pub async fn connect(url: &str, attempts: u32, backoff_cap_ms: u64) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| storage_err(&e))?;

        let mut delay = Duration::from_millis(100);
        let cap = Duration::from_millis(backoff_cap_ms);
        let mut last_err = None;

        for attempt in 1..=attempts.max(1) {
            match client.get_connection_manager().await {
                Ok(conn) => return Ok(Self { conn }),
                Err(e) => {
                    warn!("Redis connect attempt {attempt}/{attempts} failed: {e}");
                    last_err = Some(e);
                    if attempt < attempts {
                        sleep(delay).await;
                        delay = (delay * 2).min(cap);
                    }
                }
            }
        }

        Err(last_err
            .map(|e| storage_err(&e))
            .unwrap_or_else(|| Error::StorageUnavailable("no connection attempts made".into())))
    }
}

#[async_trait]
impl SessionBackend for RedisBackend {
    async fn put(&self, id: &str, record: &SessionRecord, ttl: Duration) -> Result<(), Error> {
        let payload = serde_json::to_string(record)
            .map_err(|e| Error::StorageUnavailable(format!("session serialization: {e}")))?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key(id), payload, ttl.as_secs())
            .await
            .map_err(|e| storage_err(&e))
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, Error> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(key(id)).await.map_err(|e| storage_err(&e))?;
        match payload {
            Some(json) => {
                let record = serde_json::from_str(&json)
                    .map_err(|e| Error::StorageUnavailable(format!("corrupt session record: {e}")))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn touch(&self, id: &str, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn.clone();

        // Refresh both the key TTL and the record's own timestamp so the
        // sweep and the native expiry agree.
        let payload: Option<String> = conn.get(key(id)).await.map_err(|e| storage_err(&e))?;
        let Some(json) = payload else {
            return Ok(());
        };
        if let Ok(mut record) = serde_json::from_str::<SessionRecord>(&json) {
            record.last_accessed_ms = now_ms();
            if let Ok(updated) = serde_json::to_string(&record) {
                conn.set_ex::<_, _, ()>(key(id), updated, ttl.as_secs())
                    .await
                    .map_err(|e| storage_err(&e))?;
                return Ok(());
            }
        }
        let _: bool = conn
            .expire(key(id), ttl.as_secs() as i64)
            .await
            .map_err(|e| storage_err(&e))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key(id)).await.map_err(|e| storage_err(&e))?;
        Ok(())
    }

    async fn expired_ids(&self, ttl: Duration) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();

        // SCAN, not KEYS: the sweep shares the Redis instance with whatever
        // else runs on the node and must not block it on a large keyspace.
        let mut keys = Vec::new();
        {
            let mut iter: redis::AsyncIter<'_, String> = conn
                .scan_match(format!("{KEY_PREFIX}*"))
                .await
                .map_err(|e| storage_err(&e))?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        let now = now_ms();
        let mut expired = Vec::new();
        for k in keys {
            let payload: Option<String> = conn.get(&k).await.map_err(|e| storage_err(&e))?;
            if let Some(json) = payload {
                if let Ok(record) = serde_json::from_str::<SessionRecord>(&json) {
                    if record.expired(ttl, now) {
                        expired.push(k.trim_start_matches(KEY_PREFIX).to_string());
                    }
                }
            }
        }
        Ok(expired)
    }
}
