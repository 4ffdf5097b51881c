//! SSH transport abstraction and command execution.
//!
//! The pool, executor, multiplexer, and gateway all talk to the remote host
//! through two object-safe traits:
//!
//! - [`RemoteShell`] — one authenticated transport. Every `exec`/`open_stream`
//!   call opens its own channel over the multiplexed connection, so concurrent
//!   operations interleave safely without locking the handle.
//! - [`Connector`] — opens a [`RemoteShell`] from stored credentials.
//!
//! Production wires in [`client::SshConnector`] (russh); tests substitute
//! fakes, which is what keeps the pool's single-flight behavior and the
//! gateway's state machine testable without a live SSH server.

pub mod client;
pub mod exec;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::store::Credentials;

pub use client::SshConnector;

/// Captured output of one completed remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// One chunk of continuous remote output, tagged by stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Stdout(String),
    Stderr(String),
}

/// A continuous remote output stream (e.g. a follow-mode journal tail).
///
/// `next_chunk` suspends between data chunks and returns `None` once the
/// remote side closes. `close` tears the channel down promptly so the remote
/// process does not leak past an unsubscribe.
#[async_trait]
pub trait RemoteStream: Send {
    async fn next_chunk(&mut self) -> Option<StreamChunk>;
    async fn close(&mut self);
}

/// A live authenticated remote-shell transport bound to one session.
///
/// Owned by the connection pool; everything else borrows it per-operation.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run one command to completion, collecting stdout and stderr separately.
    async fn exec(&self, command: &str) -> Result<ExecOutput, Error>;

    /// Start a long-running command and stream its output. `pty` requests a
    /// pseudo-terminal (needed for sudo-prompting commands like journalctl).
    async fn open_stream(&self, command: &str, pty: bool)
        -> Result<Box<dyn RemoteStream>, Error>;

    /// Close the underlying transport. Idempotent.
    async fn close(&self);
}

/// Opens authenticated transports from stored credentials.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteShell>, Error>;
}
