//! HTTP API surface.
//!
//! | Route                      | Method | Purpose                            |
//! |----------------------------|--------|------------------------------------|
//! | `/api/health`              | GET    | liveness and connection counts     |
//! | `/api/session/connect`     | POST   | open SSH session, set cookie       |
//! | `/api/session/disconnect`  | POST   | end session, clear cookie          |
//! | `/api/exec`                | POST   | run one command on the session     |
//! | `/api/ws`                  | GET    | realtime gateway upgrade           |

pub mod exec;
pub mod health;
pub mod session;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::state::AppState;
use crate::ws;

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.frontend_origin);

    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/session/connect", post(session::connect))
        .route("/api/session/disconnect", post(session::disconnect))
        .route("/api/exec", post(exec::exec))
        .route("/api/ws", get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Credentialed CORS for the dashboard origin. Cookies only flow when the
/// origin is echoed exactly, so a wildcard is not an option here.
fn cors_layer(frontend_origin: &str) -> CorsLayer {
    match frontend_origin.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([CONTENT_TYPE, AUTHORIZATION, COOKIE])
            .allow_credentials(true),
        Err(e) => {
            warn!("Invalid frontend origin {frontend_origin:?} ({e}), CORS disabled");
            CorsLayer::new()
        }
    }
}
