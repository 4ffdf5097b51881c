//! Session record types and the pluggable storage backend trait.
//!
//! Capability differences between deployments (Redis vs nothing) are
//! configuration, not separate code paths: [`SessionStore`](super::SessionStore)
//! talks to any [`SessionBackend`] and handles degradation itself.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Error;
use crate::store::now_ms;

/// How a session authenticates against the remote host. Exactly one variant
/// is ever present — the intake form enforces password XOR key.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password(String),
    /// PEM-encoded private key.
    PrivateKey(String),
}

/// Remote-host credentials bound to one session.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

// Credentials end up in log lines via error paths; never print the secret.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let auth = match self.auth {
            AuthMethod::Password(_) => "password(<redacted>)",
            AuthMethod::PrivateKey(_) => "private_key(<redacted>)",
        };
        write!(
            f,
            "Credentials {{ {}@{}:{}, auth: {} }}",
            self.username, self.host, self.port, auth
        )
    }
}

/// A stored session: credentials plus liveness metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub credentials: Credentials,
    /// Epoch milliseconds when the session was created.
    pub created_ms: u64,
    /// Epoch milliseconds of the last use; the TTL countdown starts here.
    pub last_accessed_ms: u64,
}

impl SessionRecord {
    pub fn new(credentials: Credentials) -> Self {
        let now = now_ms();
        Self {
            credentials,
            created_ms: now,
            last_accessed_ms: now,
        }
    }

    /// Whether the record has outlived `ttl` since its last access.
    pub fn expired(&self, ttl: Duration, now: u64) -> bool {
        now.saturating_sub(self.last_accessed_ms) > ttl.as_millis() as u64
    }
}

/// Storage operations a session backend must provide. `delete` on a missing
/// id is Ok; the sweep and explicit logout race over the same records.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Persist a record under `id` with the given TTL.
    async fn put(&self, id: &str, record: &SessionRecord, ttl: Duration) -> Result<(), Error>;

    /// Fetch a non-expired record, or `None`.
    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, Error>;

    /// Reset the TTL countdown to the full duration. No-op if missing.
    async fn touch(&self, id: &str, ttl: Duration) -> Result<(), Error>;

    /// Remove a record. Ok whether or not it existed.
    async fn delete(&self, id: &str) -> Result<(), Error>;

    /// Ids of records idle beyond `ttl`, for the periodic sweep.
    async fn expired_ids(&self, ttl: Duration) -> Result<Vec<String>, Error>;
}

/// In-process fallback store. No native TTL enforcement — expiry is checked
/// lazily on read and by the sweep. Does not survive restart and does not
/// share state across processes, which is why degrading to it is logged.
pub struct MemoryBackend {
    ttl: Duration,
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl MemoryBackend {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn put(&self, id: &str, record: &SessionRecord, _ttl: Duration) -> Result<(), Error> {
        self.records
            .lock()
            .await
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, Error> {
        let mut records = self.records.lock().await;
        // Lazy expiry: a stale record reads as absent and is dropped.
        match records.get(id) {
            Some(record) if record.expired(self.ttl, now_ms()) => {
                records.remove(id);
                Ok(None)
            }
            Some(record) => Ok(Some(record.clone())),
            None => Ok(None),
        }
    }

    async fn touch(&self, id: &str, _ttl: Duration) -> Result<(), Error> {
        if let Some(record) = self.records.lock().await.get_mut(id) {
            record.last_accessed_ms = now_ms();
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        self.records.lock().await.remove(id);
        Ok(())
    }

    async fn expired_ids(&self, ttl: Duration) -> Result<Vec<String>, Error> {
        let now = now_ms();
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|(_, r)| r.expired(ttl, now))
            .map(|(id, _)| id.clone())
            .collect())
    }
}
