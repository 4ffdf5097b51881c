#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! pillarctl library — building blocks of the Ethereum-node dashboard server.
//!
//! - `config` — TOML + env-var configuration
//! - `error` — shared error taxonomy, HTTP and shell-noise mapping
//! - `store` — TTL'd session registry (Redis with in-memory fallback)
//! - `ssh` — transport traits, russh client, command execution
//! - `pool` — session-keyed SSH connection pool (single-flight)
//! - `mux` — per-connection log tails and status polling
//! - `ws` — realtime gateway protocol and state machine
//! - `routes` — REST API route handlers
//! - `state` — shared application state (the composition root's output)

pub mod config;
pub mod error;
pub mod mux;
pub mod pool;
pub mod routes;
pub mod ssh;
pub mod state;
pub mod store;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::Error;
pub use pool::ConnectionPool;
pub use state::AppState;
pub use store::SessionStore;
