//! End-to-end tests for the realtime gateway state machine.
//!
//! These drive `run_connection` directly over channels, with a fake SSH
//! connector behind the pool, so the full path from client event to server
//! event runs without a network or a real SSH host.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use pillarctl::error::Error;
use pillarctl::ssh::{Connector, ExecOutput, RemoteShell, RemoteStream, StreamChunk};
use pillarctl::store::{AuthMethod, Credentials};
use pillarctl::ws::{run_connection, ClientEvent, ServerEvent};
use pillarctl::{AppState, Config, ConnectionPool, SessionStore};

const STATUS_OUTPUT: &str = "\
UNIT LOAD ACTIVE SUB DESCRIPTION
ethpillar-execution.service loaded active running Nethermind
ethpillar-consensus.service loaded active running Lighthouse
";

/// Stream that emits one numbered journal line every few milliseconds until
/// closed.
struct TickingStream {
    n: usize,
    open: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteStream for TickingStream {
    async fn next_chunk(&mut self) -> Option<StreamChunk> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.n += 1;
        Some(StreamChunk::Stdout(format!("journal line {}\n", self.n)))
    }

    async fn close(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeShell {
    open_streams: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(&self, _command: &str) -> Result<ExecOutput, Error> {
        Ok(ExecOutput {
            stdout: STATUS_OUTPUT.to_string(),
            stderr: String::new(),
        })
    }

    async fn open_stream(
        &self,
        _command: &str,
        _pty: bool,
    ) -> Result<Box<dyn RemoteStream>, Error> {
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TickingStream {
            n: 0,
            open: Arc::clone(&self.open_streams),
        }))
    }

    async fn close(&self) {}
}

struct FakeConnector {
    dials: AtomicUsize,
    open_streams: Arc<AtomicUsize>,
}

impl FakeConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            dials: AtomicUsize::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _credentials: &Credentials) -> Result<Arc<dyn RemoteShell>, Error> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeShell {
            open_streams: Arc::clone(&self.open_streams),
        }))
    }
}

fn credentials() -> Credentials {
    Credentials {
        host: "node.example".to_string(),
        port: 22,
        username: "ethpillar".to_string(),
        auth: AuthMethod::Password("hunter2".to_string()),
    }
}

async fn test_state(connector: Arc<FakeConnector>) -> (AppState, String) {
    let config = Arc::new(Config::default());
    let store = SessionStore::in_memory(Duration::from_secs(60));
    let session_id = store.create(credentials()).await.unwrap();
    let pool = ConnectionPool::new(Arc::clone(&store), connector);
    (AppState::new(config, store, pool), session_id)
}

/// Spawn a gateway connection, returning its event channels. Dropping the
/// returned sender simulates the client hanging up.
fn spawn_connection(
    state: &AppState,
    cookie_token: Option<String>,
) -> (mpsc::Sender<ClientEvent>, mpsc::Receiver<ServerEvent>) {
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, out_rx) = mpsc::channel(256);
    let state = state.clone();
    tokio::spawn(async move {
        run_connection(state, cookie_token, in_rx, out_tx).await;
    });
    (in_tx, out_rx)
}

async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> Option<ServerEvent> {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for server event")
}

#[tokio::test]
async fn test_cookie_auto_auth_and_status_subscription() {
    let connector = FakeConnector::new();
    let (state, session_id) = test_state(Arc::clone(&connector)).await;

    let (in_tx, mut out_rx) = spawn_connection(&state, Some(session_id));

    assert_eq!(
        next_event(&mut out_rx).await,
        Some(ServerEvent::Authenticated { success: true })
    );

    in_tx
        .send(ClientEvent::SubscribeStatus {
            interval_ms: Some(100),
        })
        .await
        .unwrap();

    // First batch fires immediately, the second after one interval; both
    // carry the full service set.
    for _ in 0..2 {
        match next_event(&mut out_rx).await {
            Some(ServerEvent::StatusUpdate { services }) => {
                let names: Vec<&str> = services.iter().map(|s| s.service.as_str()).collect();
                assert_eq!(names, vec!["ethpillar-execution", "ethpillar-consensus"]);
                assert!(services.iter().all(|s| s.status == "active running Nethermind"
                    || s.status == "active running Lighthouse"));
            }
            other => panic!("expected status update, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_unknown_cookie_closes_without_authenticating() {
    let connector = FakeConnector::new();
    let (state, _) = test_state(Arc::clone(&connector)).await;

    let (_in_tx, mut out_rx) = spawn_connection(&state, Some("bogus-token".to_string()));

    match next_event(&mut out_rx).await {
        Some(ServerEvent::Error { message }) => {
            assert!(message.contains("No active session"));
        }
        other => panic!("expected error event, got {other:?}"),
    }
    // The connection closes; no Authenticated event ever arrives.
    assert_eq!(next_event(&mut out_rx).await, None);
    assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_subscribe_before_auth_is_rejected_then_explicit_auth_works() {
    let connector = FakeConnector::new();
    let (state, session_id) = test_state(Arc::clone(&connector)).await;

    // No cookie: the connection waits for an explicit authenticate event.
    let (in_tx, mut out_rx) = spawn_connection(&state, None);

    in_tx
        .send(ClientEvent::SubscribeStatus { interval_ms: None })
        .await
        .unwrap();
    match next_event(&mut out_rx).await {
        Some(ServerEvent::Error { message }) => assert!(message.contains("Not authenticated")),
        other => panic!("expected error event, got {other:?}"),
    }

    in_tx
        .send(ClientEvent::Authenticate { token: session_id })
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut out_rx).await,
        Some(ServerEvent::Authenticated { success: true })
    );
}

#[tokio::test]
async fn test_failed_explicit_auth_keeps_connection_open() {
    let connector = FakeConnector::new();
    let (state, session_id) = test_state(Arc::clone(&connector)).await;

    let (in_tx, mut out_rx) = spawn_connection(&state, None);

    in_tx
        .send(ClientEvent::Authenticate {
            token: "wrong".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut out_rx).await,
        Some(ServerEvent::Authenticated { success: false })
    );
    assert!(matches!(
        next_event(&mut out_rx).await,
        Some(ServerEvent::Error { .. })
    ));

    // Retry with the real token on the same connection.
    in_tx
        .send(ClientEvent::Authenticate { token: session_id })
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut out_rx).await,
        Some(ServerEvent::Authenticated { success: true })
    );
}

#[tokio::test]
async fn test_two_connections_share_one_ssh_dial() {
    let connector = FakeConnector::new();
    let (state, session_id) = test_state(Arc::clone(&connector)).await;

    let (_in_a, mut out_a) = spawn_connection(&state, Some(session_id.clone()));
    let (_in_b, mut out_b) = spawn_connection(&state, Some(session_id));

    assert_eq!(
        next_event(&mut out_a).await,
        Some(ServerEvent::Authenticated { success: true })
    );
    assert_eq!(
        next_event(&mut out_b).await,
        Some(ServerEvent::Authenticated { success: true })
    );
    assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disconnect_detaches_without_killing_other_connection() {
    let connector = FakeConnector::new();
    let (state, session_id) = test_state(Arc::clone(&connector)).await;

    let (in_a, mut out_a) = spawn_connection(&state, Some(session_id.clone()));
    let (in_b, mut out_b) = spawn_connection(&state, Some(session_id.clone()));
    assert!(matches!(
        next_event(&mut out_a).await,
        Some(ServerEvent::Authenticated { success: true })
    ));
    assert!(matches!(
        next_event(&mut out_b).await,
        Some(ServerEvent::Authenticated { success: true })
    ));

    // Both connections tail the same service.
    for in_tx in [&in_a, &in_b] {
        in_tx
            .send(ClientEvent::SubscribeLogs {
                service: "ethpillar-execution".to_string(),
            })
            .await
            .unwrap();
    }
    assert!(matches!(
        next_event(&mut out_a).await,
        Some(ServerEvent::LogData { .. })
    ));
    assert!(matches!(
        next_event(&mut out_b).await,
        Some(ServerEvent::LogData { .. })
    ));

    // Client A hangs up. Its tail is torn down, B's keeps flowing, and the
    // session itself survives.
    drop(in_a);
    drop(out_a);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(
        next_event(&mut out_b).await,
        Some(ServerEvent::LogData { .. })
    ));
    assert!(state.store.exists(&session_id).await.unwrap());
    assert_eq!(state.pool.session_ids().await, vec![session_id]);

    // A's stream was closed, B's is still open.
    assert_eq!(connector.open_streams.load(Ordering::SeqCst), 1);
    drop(in_b);
}
