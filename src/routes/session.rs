//! Session lifecycle routes: connect (login) and disconnect (logout).
//!
//! `connect` dials the SSH host before creating any session state, so bad
//! credentials fail the request instead of poisoning a stored session. On
//! success the session id travels back two ways: an `ssh_session` cookie for
//! the browser, and in the JSON body for non-cookie clients.

use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::http::HeaderMap;
use axum::Json;
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::Error;
use crate::state::AppState;
use crate::store::{AuthMethod, Credentials};

fn default_port() -> u16 {
    22
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// PEM-encoded private key, alternative to `password`.
    #[serde(default)]
    pub private_key: Option<String>,
}

impl ConnectRequest {
    fn into_credentials(self) -> Result<Credentials, Error> {
        if self.host.trim().is_empty() || self.username.trim().is_empty() {
            return Err(Error::BadRequest(
                "host and username are required".to_string(),
            ));
        }
        let auth = match (self.password, self.private_key) {
            (Some(password), None) => AuthMethod::Password(password),
            (None, Some(key)) => AuthMethod::PrivateKey(key),
            _ => {
                return Err(Error::BadRequest(
                    "provide exactly one of password or private_key".to_string(),
                ))
            }
        };
        Ok(Credentials {
            host: self.host,
            port: self.port,
            username: self.username,
            auth,
        })
    }
}

/// `POST /api/session/connect`
pub async fn connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> Result<(HeaderMap, Json<Value>), Error> {
    let credentials = request.into_credentials()?;
    let session_id = state.pool.connect_and_register(credentials).await?;

    let mut headers = HeaderMap::new();
    if let Ok(cookie) = session_cookie(&state, &session_id, state.config.session.ttl_secs).parse() {
        headers.insert(SET_COOKIE, cookie);
    }

    Ok((
        headers,
        Json(json!({ "success": true, "session_id": session_id })),
    ))
}

/// `POST /api/session/disconnect`
///
/// Idempotent: succeeds whether or not a session cookie was presented.
pub async fn disconnect(
    State(state): State<AppState>,
    jar: CookieJar,
) -> (HeaderMap, Json<Value>) {
    if let Some(cookie) = jar.get(&state.config.session.cookie_name) {
        let session_id = cookie.value();
        info!("Disconnect requested for session {session_id}");
        state.pool.release(session_id).await;
    }

    let mut headers = HeaderMap::new();
    if let Ok(cookie) = session_cookie(&state, "", 0).parse() {
        headers.insert(SET_COOKIE, cookie);
    }
    (headers, Json(json!({ "success": true })))
}

/// Build the session cookie. `max_age` of zero clears it.
fn session_cookie(state: &AppState, value: &str, max_age: u64) -> String {
    format!(
        "{}={}; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age={}",
        state.config.session.cookie_name, value, max_age
    )
}
