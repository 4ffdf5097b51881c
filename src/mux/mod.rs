//! Per-connection stream multiplexer.
//!
//! One websocket can watch several things at once: follow-mode journal tails
//! for individual services and a periodic status poll across all node units.
//! The [`Multiplexer`] owns those background tasks for a single connection,
//! keyed by [`StreamKey`], and funnels everything they produce into one
//! outbound channel. Subscribing twice to the same key is a no-op;
//! unsubscribing a key that was never subscribed is safe.

pub mod logparse;
pub mod status;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{LogsConfig, StatusConfig};
use crate::error::Error;
use crate::ssh::{RemoteShell, StreamChunk};
use logparse::{parse_log_line, ParsedLogLine};
use status::{parse_service_status, status_command, ServiceStatus};

/// Identity of one subscription on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKey {
    /// Journal tail for one service.
    Logs(String),
    /// The status poll; at most one per connection.
    Status,
}

/// What a subscription task produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    LogLine {
        service: String,
        line: String,
        parsed: Option<ParsedLogLine>,
    },
    StatusUpdate(Vec<ServiceStatus>),
    /// A subscription hit an error. `fatal` marks transport-level failures
    /// where the whole SSH handle is gone and the connection should drop.
    StreamError { message: String, fatal: bool },
}

fn is_fatal(e: &Error) -> bool {
    matches!(e, Error::Transport(_))
}

/// One registered subscription. The generation tags which task owns the
/// entry: a finished task may only deregister its own generation, never a
/// successor that reused the key after an unsubscribe/resubscribe cycle.
struct Subscription {
    token: CancellationToken,
    generation: u64,
}

/// Stream registry for one websocket connection.
pub struct Multiplexer {
    logs: LogsConfig,
    status: StatusConfig,
    subscriptions: Arc<Mutex<HashMap<StreamKey, Subscription>>>,
    next_generation: AtomicU64,
}

impl Multiplexer {
    pub fn new(logs: LogsConfig, status: StatusConfig) -> Self {
        Self {
            logs,
            status,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Start a journal tail for `service`. No-op when already subscribed.
    pub async fn subscribe_logs(
        &self,
        shell: Arc<dyn RemoteShell>,
        service: &str,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let key = StreamKey::Logs(service.to_string());
        let Some((token, generation)) = self.register(key.clone()).await else {
            return;
        };

        // journalctl needs sudo for system units; the pty lets sudo run
        // without a password prompt killing the channel on NOPASSWD setups.
        let command = format!(
            "sudo journalctl -fu {service}.service --no-pager --output cat -n {}",
            self.logs.tail_lines
        );
        let service = service.to_string();
        let subscriptions = Arc::clone(&self.subscriptions);

        tokio::spawn(async move {
            run_log_tail(shell, &command, &service, &tx, &token).await;
            deregister(&subscriptions, &StreamKey::Logs(service), generation).await;
        });
    }

    /// Start the periodic status poll. No-op when already running.
    pub async fn subscribe_status(
        &self,
        shell: Arc<dyn RemoteShell>,
        interval_ms: Option<u64>,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let Some((token, generation)) = self.register(StreamKey::Status).await else {
            return;
        };

        let command = status_command(&self.status.unit_patterns);
        let interval = Duration::from_millis(interval_ms.unwrap_or(self.status.default_interval_ms));
        let subscriptions = Arc::clone(&self.subscriptions);

        tokio::spawn(async move {
            run_status_poll(shell, &command, interval, &tx, &token).await;
            deregister(&subscriptions, &StreamKey::Status, generation).await;
        });
    }

    /// Stop one subscription. Safe when the key was never subscribed.
    pub async fn unsubscribe(&self, key: &StreamKey) {
        if let Some(subscription) = self.subscriptions.lock().await.remove(key) {
            subscription.token.cancel();
            debug!("Unsubscribed {key:?}");
        }
    }

    /// Cancel every subscription; called when the connection goes away.
    pub async fn stop_all(&self) {
        let mut subs = self.subscriptions.lock().await;
        for (_, subscription) in subs.drain() {
            subscription.token.cancel();
        }
    }

    pub async fn active(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Reserve a key, returning `None` when it is already taken.
    async fn register(&self, key: StreamKey) -> Option<(CancellationToken, u64)> {
        let mut subs = self.subscriptions.lock().await;
        if subs.contains_key(&key) {
            debug!("Duplicate subscribe for {key:?} ignored");
            return None;
        }
        let token = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        subs.insert(
            key,
            Subscription {
                token: token.clone(),
                generation,
            },
        );
        Some((token, generation))
    }
}

/// Drop a finished task's registration, but only if the map still holds that
/// task's own generation. A cancelled tail spends time in the transport close
/// handshake before reaching here; a resubscribe for the same key may have
/// registered a new task in the meantime, and its entry must stay.
async fn deregister(
    subscriptions: &Mutex<HashMap<StreamKey, Subscription>>,
    key: &StreamKey,
    generation: u64,
) {
    let mut subs = subscriptions.lock().await;
    if subs.get(key).is_some_and(|s| s.generation == generation) {
        subs.remove(key);
    }
}

async fn run_log_tail(
    shell: Arc<dyn RemoteShell>,
    command: &str,
    service: &str,
    tx: &mpsc::Sender<StreamEvent>,
    token: &CancellationToken,
) {
    let mut stream = match shell.open_stream(command, true).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx
                .send(StreamEvent::StreamError {
                    message: format!("Failed to start log stream for {service}: {e}"),
                    fatal: is_fatal(&e),
                })
                .await;
            return;
        }
    };

    // Chunks arrive at arbitrary boundaries; carry the partial trailing line
    // over to the next chunk, per stream.
    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();

    loop {
        let chunk = tokio::select! {
            () = token.cancelled() => {
                stream.close().await;
                return;
            }
            chunk = stream.next_chunk() => chunk,
        };

        match chunk {
            Some(StreamChunk::Stdout(data)) => {
                stdout_buf.push_str(&data);
                for line in drain_lines(&mut stdout_buf) {
                    let parsed = parse_log_line(&line);
                    let sent = tx
                        .send(StreamEvent::LogLine {
                            service: service.to_string(),
                            line,
                            parsed,
                        })
                        .await;
                    if sent.is_err() {
                        stream.close().await;
                        return;
                    }
                }
            }
            Some(StreamChunk::Stderr(data)) => {
                stderr_buf.push_str(&data);
                for line in drain_lines(&mut stderr_buf) {
                    // The pty makes sudo chatty; its own diagnostics are
                    // noise, everything else is worth surfacing.
                    if line.contains("sudo:") {
                        continue;
                    }
                    let sent = tx
                        .send(StreamEvent::LogLine {
                            service: service.to_string(),
                            line: format!("stderr: {line}"),
                            parsed: None,
                        })
                        .await;
                    if sent.is_err() {
                        stream.close().await;
                        return;
                    }
                }
            }
            None => {
                // Follow-mode journalctl never ends on its own; the channel
                // closing means the transport is gone.
                warn!("Log stream for {service} closed unexpectedly");
                let _ = tx
                    .send(StreamEvent::StreamError {
                        message: format!("Log stream for {service} closed unexpectedly"),
                        fatal: true,
                    })
                    .await;
                return;
            }
        }
    }
}

/// Split complete lines out of `buf`, leaving any trailing partial line.
fn drain_lines(buf: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line: String = buf.drain(..=pos).collect();
        let line = line.trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

async fn run_status_poll(
    shell: Arc<dyn RemoteShell>,
    command: &str,
    interval: Duration,
    tx: &mpsc::Sender<StreamEvent>,
    token: &CancellationToken,
) {
    // First tick fires immediately so a fresh subscriber sees current state
    // without waiting a full interval.
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match shell.exec(command).await {
            Ok(output) => {
                let services = parse_service_status(&output.stdout);
                if tx.send(StreamEvent::StatusUpdate(services)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let fatal = is_fatal(&e);
                let _ = tx
                    .send(StreamEvent::StreamError {
                        message: format!("Status check failed: {e}"),
                        fatal,
                    })
                    .await;
                if fatal {
                    return;
                }
            }
        }
    }
}
