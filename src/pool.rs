//! Session-keyed SSH connection pool.
//!
//! One live [`RemoteShell`] per session id, shared by the HTTP routes and
//! every websocket attached to that session. Acquisition is single-flight:
//! when several callers race on a cold session, exactly one SSH handshake
//! runs and the rest wait for its result.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Error;
use crate::ssh::{Connector, RemoteShell};
use crate::store::{Credentials, SessionStore};

/// Per-session slot. The inner lock is held across the connect, which is what
/// makes concurrent acquires for the same id wait instead of dialing twice.
type Slot = Arc<Mutex<Option<Arc<dyn RemoteShell>>>>;

pub struct ConnectionPool {
    store: Arc<SessionStore>,
    connector: Arc<dyn Connector>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionPool {
    pub fn new(store: Arc<SessionStore>, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            store,
            connector,
            slots: Mutex::new(HashMap::new()),
        })
    }

    async fn slot(&self, session_id: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Open a transport eagerly, then register the session.
    ///
    /// Used by the connect route so credential problems surface on login
    /// rather than on the first command. The session record is only created
    /// once the handshake succeeded.
    pub async fn connect_and_register(&self, credentials: Credentials) -> Result<String, Error> {
        let shell = self.connector.connect(&credentials).await?;
        let session_id = self.store.create(credentials).await?;

        let slot = self.slot(&session_id).await;
        *slot.lock().await = Some(shell);
        info!("Session {session_id} connected");
        Ok(session_id)
    }

    /// Return the live handle for a session, dialing on a cold slot.
    ///
    /// Every successful acquire counts as session activity and refreshes the
    /// TTL. Fails with `NoActiveSession` when the session is missing or
    /// expired.
    pub async fn acquire(&self, session_id: &str) -> Result<Arc<dyn RemoteShell>, Error> {
        let slot = self.slot(session_id).await;
        let mut guard = slot.lock().await;

        if let Some(shell) = guard.as_ref() {
            self.store.touch(session_id).await;
            return Ok(shell.clone());
        }

        match self.dial(session_id).await {
            Ok(shell) => {
                *guard = Some(shell.clone());
                self.store.touch(session_id).await;
                Ok(shell)
            }
            Err(e) => {
                // A failed dial must not leave a phantom entry in the map.
                // The inner guard is still held, so only this slot instance
                // can be removed, never a replacement.
                let mut slots = self.slots.lock().await;
                if slots.get(session_id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    slots.remove(session_id);
                }
                Err(e)
            }
        }
    }

    /// Validate the session, then open a transport from its credentials.
    async fn dial(&self, session_id: &str) -> Result<Arc<dyn RemoteShell>, Error> {
        let credentials = self.store.get(session_id).await?;
        debug!("Reconnecting SSH transport for session {session_id}");
        self.connector.connect(&credentials).await
    }

    /// Drop the cached handle without ending the session. The next acquire
    /// redials from stored credentials.
    pub async fn invalidate(&self, session_id: &str) {
        let removed = self.slots.lock().await.remove(session_id);
        if let Some(slot) = removed {
            if let Some(shell) = slot.lock().await.take() {
                shell.close().await;
            }
            debug!("Invalidated transport for session {session_id}");
        }
    }

    /// End the session: close the transport and delete the record. Idempotent.
    pub async fn release(&self, session_id: &str) {
        let removed = self.slots.lock().await.remove(session_id);
        if let Some(slot) = removed {
            if let Some(shell) = slot.lock().await.take() {
                shell.close().await;
            }
        }
        self.store.delete(session_id).await;
        info!("Session {session_id} released");
    }

    /// Ids with a pooled slot (live or mid-connect).
    pub async fn session_ids(&self) -> Vec<String> {
        self.slots.lock().await.keys().cloned().collect()
    }

    /// Close every pooled transport. Session records are left alone so that
    /// durable sessions survive a restart.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = {
            let mut map = self.slots.lock().await;
            map.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            if let Some(shell) = slot.lock().await.take() {
                shell.close().await;
            }
        }
        info!("Connection pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{ExecOutput, RemoteStream, StreamChunk};
    use crate::store::AuthMethod;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeShell {
        closed: AtomicUsize,
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn exec(&self, _command: &str) -> Result<ExecOutput, Error> {
            Ok(ExecOutput::default())
        }
        async fn open_stream(
            &self,
            _command: &str,
            _pty: bool,
        ) -> Result<Box<dyn RemoteStream>, Error> {
            struct Empty;
            #[async_trait]
            impl RemoteStream for Empty {
                async fn next_chunk(&mut self) -> Option<StreamChunk> {
                    None
                }
                async fn close(&mut self) {}
            }
            Ok(Box::new(Empty))
        }
        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Connector that counts dials and can simulate handshake latency.
    struct CountingConnector {
        dials: AtomicUsize,
        delay: Duration,
    }

    impl CountingConnector {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                dials: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, _credentials: &Credentials) -> Result<Arc<dyn RemoteShell>, Error> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Arc::new(FakeShell {
                closed: AtomicUsize::new(0),
            }))
        }
    }

    fn creds() -> Credentials {
        Credentials {
            host: "node.example".to_string(),
            port: 22,
            username: "ethpillar".to_string(),
            auth: AuthMethod::Password("hunter2".to_string()),
        }
    }

    #[tokio::test]
    async fn test_acquire_unknown_session_fails() {
        let store = SessionStore::in_memory(Duration::from_secs(60));
        let connector = CountingConnector::new(Duration::ZERO);
        let pool = ConnectionPool::new(store, connector.clone());

        let err = pool.acquire("no-such-session").await.err().unwrap();
        assert!(matches!(err, Error::NoActiveSession));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
        // The failed acquire leaves no phantom slot behind.
        assert!(pool.session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_dial_leaves_no_slot() {
        struct RefusingConnector;

        #[async_trait]
        impl Connector for RefusingConnector {
            async fn connect(
                &self,
                _credentials: &Credentials,
            ) -> Result<Arc<dyn RemoteShell>, Error> {
                Err(Error::Transport("connection refused".to_string()))
            }
        }

        let store = SessionStore::in_memory(Duration::from_secs(60));
        let id = store.create(creds()).await.unwrap();
        let pool = ConnectionPool::new(store, Arc::new(RefusingConnector));

        assert!(matches!(
            pool.acquire(&id).await,
            Err(Error::Transport(_))
        ));
        assert!(pool.session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_reuses_cached_handle() {
        let store = SessionStore::in_memory(Duration::from_secs(60));
        let connector = CountingConnector::new(Duration::ZERO);
        let pool = ConnectionPool::new(store, connector.clone());

        let id = pool.connect_and_register(creds()).await.unwrap();
        pool.acquire(&id).await.unwrap();
        pool.acquire(&id).await.unwrap();
        // One dial from registration, zero from the cached acquires.
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_dial_once() {
        let store = SessionStore::in_memory(Duration::from_secs(60));
        let id = store.create(creds()).await.unwrap();

        let connector = CountingConnector::new(Duration::from_millis(40));
        let pool = ConnectionPool::new(store, connector.clone());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move { pool.acquire(&id).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_redials_after_invalidate() {
        let store = SessionStore::in_memory(Duration::from_secs(60));
        let connector = CountingConnector::new(Duration::ZERO);
        let pool = ConnectionPool::new(store, connector.clone());

        let id = pool.connect_and_register(creds()).await.unwrap();
        pool.invalidate(&id).await;
        pool.acquire(&id).await.unwrap();
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_ends_session() {
        let store = SessionStore::in_memory(Duration::from_secs(60));
        let connector = CountingConnector::new(Duration::ZERO);
        let pool = ConnectionPool::new(store.clone(), connector);

        let id = pool.connect_and_register(creds()).await.unwrap();
        pool.release(&id).await;
        pool.release(&id).await; // idempotent

        assert!(!store.exists(&id).await.unwrap());
        assert!(matches!(pool.acquire(&id).await, Err(Error::NoActiveSession)));
        assert!(pool.session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_refreshes_ttl() {
        let store = SessionStore::in_memory(Duration::from_millis(80));
        let connector = CountingConnector::new(Duration::ZERO);
        let pool = ConnectionPool::new(store.clone(), connector);

        let id = pool.connect_and_register(creds()).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            pool.acquire(&id).await.unwrap();
        }
        assert!(store.exists(&id).await.unwrap());
    }
}
