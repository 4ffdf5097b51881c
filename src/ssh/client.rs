//! russh-backed implementation of the transport traits.
//!
//! One [`SshShell`] wraps one authenticated `russh::client::Handle`. Channels
//! are opened per operation — the SSH connection itself is multiplexed, so a
//! log tail and a one-shot command can run side by side on the same handle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::SshConfig;
use crate::error::Error;
use crate::ssh::{Connector, ExecOutput, RemoteShell, RemoteStream, StreamChunk};
use crate::store::{AuthMethod, Credentials};

fn transport_err(e: impl std::fmt::Display) -> Error {
    Error::Transport(e.to_string())
}

/// Terminal dimensions requested for pty-backed streams. The remote side only
/// uses them for line wrapping; journal output is consumed line-wise anyway.
const PTY_COLS: u32 = 200;
const PTY_ROWS: u32 = 50;

/// russh client handler. The dashboard targets whatever host the operator
/// typed into the connect form, so there is no pinned host key to verify.
struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens SSH transports with bounded retries and capped exponential backoff.
///
/// Transport-level failures (refused, timed out, dropped mid-handshake) are
/// retried up to `connect_attempts` times. Credential rejection is surfaced
/// immediately — retrying a wrong password only triggers remote lockouts.
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    async fn connect_once(&self, credentials: &Credentials) -> Result<SshShell, Error> {
        let ssh_config = Arc::new(client::Config::default());
        let addr = (credentials.host.as_str(), credentials.port);

        let mut handle = timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            client::connect(ssh_config, addr, AcceptingHandler),
        )
        .await
        .map_err(|_| {
            Error::Transport(format!(
                "connect to {}:{} timed out after {}s",
                credentials.host, credentials.port, self.config.connect_timeout_secs
            ))
        })?
        .map_err(transport_err)?;

        let auth = match &credentials.auth {
            AuthMethod::Password(password) => handle
                .authenticate_password(&credentials.username, password)
                .await
                .map_err(transport_err)?,
            AuthMethod::PrivateKey(pem) => {
                let key = decode_secret_key(pem, None)
                    .map_err(|e| Error::AuthenticationFailed(format!("invalid private key: {e}")))?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(transport_err)?
                    .flatten();
                handle
                    .authenticate_publickey(
                        &credentials.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
                    .map_err(transport_err)?
            }
        };

        if !auth.success() {
            return Err(Error::AuthenticationFailed(format!(
                "remote host rejected credentials for {}@{}",
                credentials.username, credentials.host
            )));
        }

        debug!(
            "SSH transport ready for {}@{}:{}",
            credentials.username, credentials.host, credentials.port
        );
        Ok(SshShell { handle })
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteShell>, Error> {
        let attempts = self.config.connect_attempts.max(1);
        let mut delay = Duration::from_millis(250);
        let cap = Duration::from_millis(self.config.backoff_cap_ms);
        let mut last_err = Error::Transport("no connection attempts made".to_string());

        for attempt in 1..=attempts {
            match self.connect_once(credentials).await {
                Ok(shell) => return Ok(Arc::new(shell)),
                // Credential rejection will not improve with retries.
                Err(e @ Error::AuthenticationFailed(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        "SSH connect attempt {attempt}/{attempts} to {} failed: {e}",
                        credentials.host
                    );
                    last_err = e;
                    if attempt < attempts {
                        sleep(delay).await;
                        delay = (delay * 2).min(cap);
                    }
                }
            }
        }
        Err(last_err)
    }
}

/// One authenticated russh transport.
pub struct SshShell {
    handle: Handle<AcceptingHandler>,
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, command: &str) -> Result<ExecOutput, Error> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(transport_err)?;
        channel.exec(true, command).await.map_err(transport_err)?;

        let mut output = ExecOutput::default();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { ref data }) => {
                    output.stdout.push_str(&String::from_utf8_lossy(data));
                }
                Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                    output.stderr.push_str(&String::from_utf8_lossy(data));
                }
                Some(ChannelMsg::ExitStatus { .. }) => {
                    // Output reconciliation decides success, not the exit
                    // code — keep draining until the channel closes.
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        Ok(output)
    }

    async fn open_stream(
        &self,
        command: &str,
        pty: bool,
    ) -> Result<Box<dyn RemoteStream>, Error> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(transport_err)?;
        if pty {
            channel
                .request_pty(false, "xterm-256color", PTY_COLS, PTY_ROWS, 0, 0, &[])
                .await
                .map_err(transport_err)?;
        }
        channel.exec(true, command).await.map_err(transport_err)?;
        Ok(Box::new(SshStream { channel }))
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await;
    }
}

/// A streaming channel (follow-mode command) over an [`SshShell`].
struct SshStream {
    channel: russh::Channel<client::Msg>,
}

#[async_trait]
impl RemoteStream for SshStream {
    async fn next_chunk(&mut self) -> Option<StreamChunk> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { ref data } => {
                    return Some(StreamChunk::Stdout(
                        String::from_utf8_lossy(data).into_owned(),
                    ));
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    return Some(StreamChunk::Stderr(
                        String::from_utf8_lossy(data).into_owned(),
                    ));
                }
                ChannelMsg::Eof | ChannelMsg::Close => return None,
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        // Bounded by the transport's close handshake; the remote journalctl
        // is torn down with the channel.
        let _ = self.channel.close().await;
    }
}
