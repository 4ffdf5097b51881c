//! Error taxonomy shared by the HTTP routes, the WebSocket gateway, and the
//! SSH plumbing underneath them.
//!
//! One enum covers the whole surface so callers can match on failure class
//! rather than string-compare messages. HTTP handlers return `Error` directly
//! (it implements [`IntoResponse`]); the gateway maps it to an `error` event.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failure classes for remote-session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Session id is missing, unknown, or expired — the user must log in again.
    #[error("No active session, login again")]
    NoActiveSession,

    /// The remote host rejected the supplied credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Network-level failure while connecting or mid-operation. Potentially
    /// transient; connect paths retry internally before surfacing this.
    #[error("SSH transport error: {0}")]
    Transport(String),

    /// The remote command produced only error output.
    #[error("{0}")]
    CommandFailed(String),

    /// The durable session backend is unreachable and the in-memory fallback
    /// is disabled by configuration.
    #[error("Session storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A realtime-protocol request arrived before authentication completed.
    #[error("Not authenticated")]
    Unauthenticated,

    /// Malformed or incomplete request payload.
    #[error("{0}")]
    BadRequest(String),
}

impl Error {
    /// Stable machine-readable code for the error payload.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoActiveSession => "NO_ACTIVE_SESSION",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::CommandFailed(_) => "COMMAND_FAILED",
            Self::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::BadRequest(_) => "BAD_REQUEST",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NoActiveSession | Self::Unauthenticated | Self::AuthenticationFailed(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::CommandFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let message = clean_shell_error(&self.to_string());
        let body = json!({
            "error": self.code(),
            "message": message,
        });
        (self.status(), Json(body)).into_response()
    }
}

/// Strip interactive-shell noise from remote error text before it reaches the
/// user. Commands run through `bash -i` so the shell complains about missing
/// job control; those lines carry no information about the actual failure.
pub fn clean_shell_error(message: &str) -> String {
    if !message.contains("bash:") {
        return message.to_string();
    }

    let last = message.rsplit("bash:").next().unwrap_or(message).trim();

    if last.contains("Command '") && last.contains("not found") {
        return last.to_string();
    }

    let cleaned = last
        .lines()
        .filter(|line| {
            !line.contains("cannot set terminal process group")
                && !line.contains("no job control in this shell")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();

    if cleaned.is_empty() {
        last.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_shell_error_passthrough() {
        assert_eq!(clean_shell_error("connection refused"), "connection refused");
    }

    #[test]
    fn test_clean_shell_error_strips_job_control_noise() {
        let raw = "bash: cannot set terminal process group (-1): Inappropriate ioctl for device\n\
                   bash: no job control in this shell\nls: cannot access '/nope': No such file or directory";
        let cleaned = clean_shell_error(raw);
        assert!(cleaned.contains("No such file or directory"));
        assert!(!cleaned.contains("job control"));
    }

    #[test]
    fn test_clean_shell_error_command_not_found() {
        let raw = "bash: line 1: Command 'ethpillar' not found";
        assert!(clean_shell_error(raw).contains("not found"));
    }
}
