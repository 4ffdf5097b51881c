//! Shared application state, assembled once at startup and handed to every
//! handler. No globals: anything a route or websocket needs travels here.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::pool::ConnectionPool;
use crate::store::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub pool: Arc<ConnectionPool>,
    pub start_time: Instant,
    /// Live websocket connections, reported by the heartbeat log and the
    /// health endpoint.
    pub ws_connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(config: Arc<Config>, store: Arc<SessionStore>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            config,
            store,
            pool,
            start_time: Instant::now(),
            ws_connections: Arc::new(AtomicUsize::new(0)),
        }
    }
}
