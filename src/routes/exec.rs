//! One-shot remote command execution over the pooled session.

use axum::extract::State;
use axum::Json;
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::Error;
use crate::ssh::exec::execute;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: String,
}

/// `POST /api/exec`
///
/// Requires the session cookie. Reuses the pooled SSH handle, dialing from
/// stored credentials when the pool is cold (e.g. after a server restart with
/// a durable session store).
pub async fn exec(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<ExecRequest>,
) -> Result<Json<Value>, Error> {
    let session_id = jar
        .get(&state.config.session.cookie_name)
        .map(|c| c.value().to_string())
        .ok_or(Error::NoActiveSession)?;

    let command = request.command.trim();
    if command.is_empty() {
        return Err(Error::BadRequest("command must not be empty".to_string()));
    }

    let shell = state.pool.acquire(&session_id).await?;
    debug!("Executing command for session {session_id}");
    let output = execute(shell.as_ref(), command).await?;
    Ok(Json(json!({ "success": true, "output": output })))
}
