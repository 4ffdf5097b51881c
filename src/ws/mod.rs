//! Realtime gateway: the websocket endpoint and its connection state machine.
//!
//! A connection moves through these states:
//!
//! | State                  | Entered when                                  |
//! |------------------------|-----------------------------------------------|
//! | Pending                | upgrade accepted                              |
//! | AutoAuthenticating     | the upgrade carried a session cookie          |
//! | AwaitingExplicitAuth   | no cookie; waiting for an `authenticate` event|
//! | Authenticated          | token validated, SSH handle acquired          |
//! | Closed                 | client went away or a fatal error forced it   |
//!
//! Auto-auth failure closes the connection (the cookie was wrong, nothing the
//! client sends can fix it); explicit-auth failure leaves the connection open
//! for another attempt. Disconnecting detaches the websocket from the pooled
//! SSH handle without closing it — the session outlives the socket.
//!
//! The socket itself is only an adapter: a reader task decodes JSON frames
//! into [`ClientEvent`]s and a writer task encodes [`ServerEvent`]s back,
//! while [`run_connection`] owns all the logic in between. Tests drive
//! `run_connection` directly over channels.

pub mod protocol;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum_extra::extract::CookieJar;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{clean_shell_error, Error};
use crate::mux::{Multiplexer, StreamEvent, StreamKey};
use crate::ssh::RemoteShell;
use crate::state::AppState;
pub use protocol::{ClientEvent, ServerEvent};

/// `GET /api/ws` — upgrade to the realtime protocol. The session cookie, when
/// present, triggers automatic authentication before any client event.
pub async fn ws_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    ws: WebSocketUpgrade,
) -> Response {
    let token = jar
        .get(&state.config.session.cookie_name)
        .map(|c| c.value().to_string());
    ws.on_upgrade(move |socket| handle_socket(state, socket, token))
}

async fn handle_socket(state: AppState, socket: WebSocket, token: Option<String>) {
    state.ws_connections.fetch_add(1, Ordering::Relaxed);
    debug!("WebSocket connected (cookie auth: {})", token.is_some());

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(64);
    let (inbound_tx, inbound_rx) = mpsc::channel::<ClientEvent>(64);

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_outbound = outbound_tx.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        if inbound_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = reader_outbound
                            .send(ServerEvent::Error {
                                message: format!("Unrecognized message: {e}"),
                            })
                            .await;
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    run_connection(state.clone(), token, inbound_rx, outbound_tx).await;

    // run_connection returned: tear the adapters down. The writer drains and
    // exits once the last sender (held by the reader) is gone.
    reader.abort();
    let _ = writer.await;

    state.ws_connections.fetch_sub(1, Ordering::Relaxed);
    debug!("WebSocket disconnected");
}

/// The authenticated half of a connection: which session it belongs to and
/// the pooled handle its subscriptions run over.
struct AuthedSession {
    session_id: String,
    shell: Arc<dyn RemoteShell>,
}

/// Drive one realtime connection to completion.
///
/// Consumes decoded client events from `inbound` and emits server events on
/// `outbound` until the client goes away (`inbound` closes), authentication
/// fails fatally, or a subscription reports a dead transport.
pub async fn run_connection(
    state: AppState,
    cookie_token: Option<String>,
    mut inbound: mpsc::Receiver<ClientEvent>,
    outbound: mpsc::Sender<ServerEvent>,
) {
    let mux = Multiplexer::new(state.config.logs.clone(), state.config.status.clone());
    let (stream_tx, mut stream_rx) = mpsc::channel::<StreamEvent>(256);

    let mut session: Option<AuthedSession> = None;

    // Auto-authentication: a bad cookie is not recoverable from the client
    // side, so failure closes the connection immediately.
    if let Some(token) = cookie_token {
        match authenticate(&state, &token).await {
            Ok(authed) => {
                info!("WebSocket auto-authenticated for session {token}");
                session = Some(authed);
                if outbound
                    .send(ServerEvent::Authenticated { success: true })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!("WebSocket auto-authentication failed: {e}");
                let _ = outbound
                    .send(ServerEvent::Error {
                        message: clean_shell_error(&e.to_string()),
                    })
                    .await;
                return;
            }
        }
    }

    loop {
        tokio::select! {
            event = inbound.recv() => {
                let Some(event) = event else {
                    break;
                };
                match handle_client_event(&state, &mux, &mut session, event, &stream_tx, &outbound).await {
                    ConnectionControl::Continue => {}
                    ConnectionControl::Close => break,
                }
            }
            event = stream_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                match handle_stream_event(&state, &session, event, &outbound).await {
                    ConnectionControl::Continue => {}
                    ConnectionControl::Close => break,
                }
            }
        }
    }

    // Detach, don't hang up: subscriptions die with the socket but the pooled
    // SSH handle stays live for HTTP commands and future reconnects.
    mux.stop_all().await;
}

enum ConnectionControl {
    Continue,
    Close,
}

async fn handle_client_event(
    state: &AppState,
    mux: &Multiplexer,
    session: &mut Option<AuthedSession>,
    event: ClientEvent,
    stream_tx: &mpsc::Sender<StreamEvent>,
    outbound: &mpsc::Sender<ServerEvent>,
) -> ConnectionControl {
    match event {
        // Explicit auth failure keeps the connection open for a retry.
        ClientEvent::Authenticate { token } => match authenticate(state, &token).await {
            Ok(authed) => {
                info!("WebSocket authenticated for session {token}");
                *session = Some(authed);
                send_or_close(outbound, ServerEvent::Authenticated { success: true }).await
            }
            Err(e) => {
                warn!("WebSocket authentication failed: {e}");
                let _ = outbound
                    .send(ServerEvent::Authenticated { success: false })
                    .await;
                send_or_close(
                    outbound,
                    ServerEvent::Error {
                        message: clean_shell_error(&e.to_string()),
                    },
                )
                .await
            }
        },
        other => {
            let Some(authed) = session.as_ref() else {
                return send_or_close(
                    outbound,
                    ServerEvent::Error {
                        message: Error::Unauthenticated.to_string(),
                    },
                )
                .await;
            };

            match other {
                ClientEvent::Authenticate { .. } => unreachable!("handled above"),
                ClientEvent::SubscribeLogs { service } => {
                    if !valid_service_name(&service) {
                        return send_or_close(
                            outbound,
                            ServerEvent::Error {
                                message: format!("Invalid service name: {service}"),
                            },
                        )
                        .await;
                    }
                    mux.subscribe_logs(Arc::clone(&authed.shell), &service, stream_tx.clone())
                        .await;
                    ConnectionControl::Continue
                }
                ClientEvent::UnsubscribeLogs { service } => {
                    mux.unsubscribe(&StreamKey::Logs(service)).await;
                    ConnectionControl::Continue
                }
                ClientEvent::SubscribeStatus { interval_ms } => {
                    mux.subscribe_status(Arc::clone(&authed.shell), interval_ms, stream_tx.clone())
                        .await;
                    ConnectionControl::Continue
                }
                ClientEvent::UnsubscribeStatus => {
                    mux.unsubscribe(&StreamKey::Status).await;
                    ConnectionControl::Continue
                }
            }
        }
    }
}

async fn handle_stream_event(
    state: &AppState,
    session: &Option<AuthedSession>,
    event: StreamEvent,
    outbound: &mpsc::Sender<ServerEvent>,
) -> ConnectionControl {
    match event {
        StreamEvent::LogLine {
            service,
            line,
            parsed,
        } => {
            send_or_close(
                outbound,
                ServerEvent::LogData {
                    service,
                    line,
                    parsed,
                },
            )
            .await
        }
        StreamEvent::StatusUpdate(services) => {
            send_or_close(outbound, ServerEvent::StatusUpdate { services }).await
        }
        StreamEvent::StreamError { message, fatal } => {
            let _ = outbound.send(ServerEvent::Error { message }).await;
            if fatal {
                // The transport under the pooled handle is gone; drop it so
                // the next acquire redials instead of reusing a dead socket.
                if let Some(authed) = session {
                    warn!(
                        "Transport failure on session {}, invalidating pooled handle",
                        authed.session_id
                    );
                    state.pool.invalidate(&authed.session_id).await;
                }
                ConnectionControl::Close
            } else {
                ConnectionControl::Continue
            }
        }
    }
}

/// Validate the token against the session store and attach to the pooled
/// SSH handle, dialing if the slot is cold.
async fn authenticate(state: &AppState, token: &str) -> Result<AuthedSession, Error> {
    if !state.store.exists(token).await? {
        return Err(Error::NoActiveSession);
    }
    let shell = state.pool.acquire(token).await?;
    Ok(AuthedSession {
        session_id: token.to_string(),
        shell,
    })
}

/// Service names land inside a remote shell command; restrict them to the
/// characters systemd unit names actually use.
fn valid_service_name(service: &str) -> bool {
    !service.is_empty()
        && service.len() <= 256
        && service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':'))
}

async fn send_or_close(
    outbound: &mpsc::Sender<ServerEvent>,
    event: ServerEvent,
) -> ConnectionControl {
    if outbound.send(event).await.is_err() {
        ConnectionControl::Close
    } else {
        ConnectionControl::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_service_names() {
        assert!(valid_service_name("ethpillar-execution"));
        assert!(valid_service_name("consensus_client.v2"));
        assert!(valid_service_name("getty@tty1"));
    }

    #[test]
    fn test_rejects_shell_metacharacters() {
        assert!(!valid_service_name(""));
        assert!(!valid_service_name("x; rm -rf /"));
        assert!(!valid_service_name("a b"));
        assert!(!valid_service_name("$(whoami)"));
    }
}
