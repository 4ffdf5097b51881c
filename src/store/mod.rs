//! Session registry with TTL semantics and storage degradation.
//!
//! [`SessionStore`] is the single authority for session records. It prefers a
//! durable Redis backend when one is configured and reachable, and otherwise
//! degrades to an in-process map so the service stays usable — at the cost of
//! sessions not surviving a restart, which is logged loudly exactly once.
//!
//! Records expire `ttl_secs` after their last access. Redis enforces this
//! natively; the in-memory fallback relies on lazy expiry plus the periodic
//! [`sweep`](SessionStore::sweep), which also reports expired ids so the
//! connection pool can close the matching SSH handles.

pub mod backend;
pub mod redis;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Error;
pub use backend::{AuthMethod, Credentials, MemoryBackend, SessionBackend, SessionRecord};
pub use redis::RedisBackend;

/// Epoch milliseconds now.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// TTL'd registry mapping session ids to remote-host credentials.
///
/// Cloneable via `Arc` at the composition root; every operation takes `&self`.
pub struct SessionStore {
    /// Durable backend, `None` when Redis is not configured or was unreachable
    /// at startup.
    primary: Option<Box<dyn SessionBackend>>,
    /// Connect error text when a durable backend was configured but could not
    /// be reached at startup. With the fallback disabled, session operations
    /// surface this as `StorageUnavailable` instead of silently degrading.
    primary_error: Option<String>,
    /// In-process fallback, always present.
    fallback: MemoryBackend,
    allow_fallback: bool,
    ttl: Duration,
    /// Set once the first degraded write happens, to keep the log readable.
    degraded_logged: AtomicBool,
}

impl SessionStore {
    /// Build the store from configuration, attempting the Redis connection
    /// with bounded retries when a URL is configured.
    pub async fn from_config(config: &Config) -> Arc<Self> {
        let ttl = Duration::from_secs(config.session.ttl_secs);
        let allow_fallback = config.session.allow_memory_fallback;
        let mut primary_error = None;

        let primary: Option<Box<dyn SessionBackend>> = match config.redis.url.as_deref() {
            Some(url) => {
                match RedisBackend::connect(
                    url,
                    config.redis.connect_attempts,
                    config.redis.backoff_cap_ms,
                )
                .await
                {
                    Ok(backend) => {
                        info!("Redis session store connected");
                        Some(Box::new(backend))
                    }
                    Err(e) => {
                        if allow_fallback {
                            warn!(
                                "Redis unreachable after {} attempts ({e}), \
                                 using in-memory session storage — sessions will not \
                                 survive a restart",
                                config.redis.connect_attempts
                            );
                        } else {
                            warn!(
                                "Redis unreachable after {} attempts ({e}) and the \
                                 in-memory fallback is disabled — session operations \
                                 will fail until Redis is back",
                                config.redis.connect_attempts
                            );
                        }
                        primary_error = Some(e.to_string());
                        None
                    }
                }
            }
            None => {
                info!("No Redis configured, using in-memory session storage");
                None
            }
        };

        Arc::new(Self {
            primary,
            primary_error,
            fallback: MemoryBackend::new(ttl),
            allow_fallback,
            ttl,
            degraded_logged: AtomicBool::new(false),
        })
    }

    /// Memory-only store, used by tests and by deployments without Redis.
    pub fn in_memory(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            primary: None,
            primary_error: None,
            fallback: MemoryBackend::new(ttl),
            allow_fallback: true,
            ttl,
            degraded_logged: AtomicBool::new(false),
        })
    }

    /// Store whose configured durable backend never came up, as `from_config`
    /// builds after exhausting its connect attempts.
    #[cfg(test)]
    fn with_unreachable_primary(ttl: Duration, allow_fallback: bool) -> Arc<Self> {
        Arc::new(Self {
            primary: None,
            primary_error: Some("connection refused".to_string()),
            fallback: MemoryBackend::new(ttl),
            allow_fallback,
            ttl,
            degraded_logged: AtomicBool::new(false),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn note_degraded(&self, op: &str, e: &Error) {
        if !self.degraded_logged.swap(true, Ordering::Relaxed) {
            warn!(
                "Session store degraded to in-memory fallback ({op}: {e}) — \
                 state is per-process and lost on restart"
            );
        }
    }

    /// Generate a fresh unguessable identifier and persist the record.
    ///
    /// Fails with `StorageUnavailable` only when the durable backend is down
    /// and the fallback is disabled by configuration.
    pub async fn create(&self, credentials: Credentials) -> Result<String, Error> {
        let session_id = Uuid::new_v4().to_string();
        let record = SessionRecord::new(credentials);

        if let Some(primary) = &self.primary {
            match primary.put(&session_id, &record, self.ttl).await {
                Ok(()) => return Ok(session_id),
                Err(e) if self.allow_fallback => self.note_degraded("put", &e),
                Err(e) => return Err(e),
            }
        }

        self.require_fallback_allowed()?;
        self.fallback.put(&session_id, &record, self.ttl).await?;
        Ok(session_id)
    }

    /// True iff a non-expired record exists.
    pub async fn exists(&self, session_id: &str) -> Result<bool, Error> {
        Ok(self.lookup(session_id).await?.is_some())
    }

    /// Fetch credentials, failing with `NoActiveSession` when missing or
    /// expired.
    pub async fn get(&self, session_id: &str) -> Result<Credentials, Error> {
        match self.lookup(session_id).await? {
            Some(record) => Ok(record.credentials),
            None => Err(Error::NoActiveSession),
        }
    }

    /// Reset the TTL countdown to the full duration. No-op if missing.
    pub async fn touch(&self, session_id: &str) {
        if let Some(primary) = &self.primary {
            if let Err(e) = primary.touch(session_id, self.ttl).await {
                if self.allow_fallback {
                    self.note_degraded("touch", &e);
                } else {
                    warn!("Failed to refresh session {session_id} TTL: {e}");
                }
            }
        }
        // The fallback touch is infallible; keep it in sync regardless.
        let _ = self.fallback.touch(session_id, self.ttl).await;
    }

    /// Idempotent removal from every backend.
    pub async fn delete(&self, session_id: &str) {
        if let Some(primary) = &self.primary {
            if let Err(e) = primary.delete(session_id).await {
                warn!("Failed to delete session {session_id} from durable store: {e}");
            }
        }
        let _ = self.fallback.delete(session_id).await;
    }

    /// Delete every record idle beyond the TTL and return the affected ids so
    /// the caller can close any associated connection handles.
    pub async fn sweep(&self) -> Vec<String> {
        let mut expired = Vec::new();

        if let Some(primary) = &self.primary {
            match primary.expired_ids(self.ttl).await {
                Ok(ids) => expired.extend(ids),
                Err(e) => warn!("Session sweep could not scan durable store: {e}"),
            }
        }
        if let Ok(ids) = self.fallback.expired_ids(self.ttl).await {
            for id in ids {
                if !expired.contains(&id) {
                    expired.push(id);
                }
            }
        }

        for id in &expired {
            self.delete(id).await;
        }
        if !expired.is_empty() {
            info!("Session sweep expired {} session(s)", expired.len());
        }
        expired
    }

    async fn lookup(&self, session_id: &str) -> Result<Option<SessionRecord>, Error> {
        if let Some(primary) = &self.primary {
            match primary.get(session_id).await {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => {
                    // A record written during a past degradation may only
                    // exist in the fallback.
                    if !self.allow_fallback {
                        return Ok(None);
                    }
                }
                Err(e) if self.allow_fallback => self.note_degraded("get", &e),
                Err(e) => return Err(e),
            }
        }
        self.require_fallback_allowed()?;
        self.fallback.get(session_id).await
    }

    /// A durable backend that was configured but never came up means session
    /// operations fail rather than degrade when the fallback is disabled.
    fn require_fallback_allowed(&self) -> Result<(), Error> {
        match &self.primary_error {
            Some(err) if !self.allow_fallback => Err(Error::StorageUnavailable(err.clone())),
            _ => Ok(()),
        }
    }
}
