//! One-shot command execution with output reconciliation.
//!
//! Remote tools are messy about their streams: several EthPillar helpers
//! write progress to stderr while succeeding, and `git clone` writes almost
//! everything there. [`execute`] collects both streams and applies the rules
//! below so callers get a single deterministic output string:
//!
//! 1. clone-style fetch commands return stdout + stderr concatenated, in that
//!    order, even when both are non-empty — their stderr is informational;
//! 2. stderr with empty stdout is a failure (`CommandFailed` carrying the
//!    stderr text);
//! 3. otherwise stdout wins, falling back to stderr when stdout is empty.

use crate::error::Error;
use crate::ssh::{ExecOutput, RemoteShell};

/// Wrap a command so it runs inside the remote user's interactive shell
/// environment — profile aliases and PATH additions (the EthPillar install
/// puts its CLI on the PATH via .bashrc) apply.
pub fn wrap_interactive(command: &str) -> String {
    format!("/bin/bash -i -c 'source ~/.bashrc 2>/dev/null; {command}'")
}

/// Long-running fetch operations whose stderr is progress, not failure.
fn is_fetch_command(command: &str) -> bool {
    command.contains("git clone")
}

/// Run one command over the handle and reconcile its output.
///
/// Transport-level failures (connection dropped mid-command) surface as
/// [`Error::Transport`]; the caller decides whether to retry.
pub async fn execute(shell: &dyn RemoteShell, command: &str) -> Result<String, Error> {
    let output = shell.exec(&wrap_interactive(command)).await?;
    reconcile(command, output)
}

fn reconcile(command: &str, output: ExecOutput) -> Result<String, Error> {
    let ExecOutput { stdout, stderr } = output;

    if is_fetch_command(command) && !stderr.is_empty() {
        return Ok(format!("{stdout}{stderr}"));
    }
    if !stderr.is_empty() && stdout.is_empty() {
        return Err(Error::CommandFailed(stderr));
    }
    if stdout.is_empty() {
        Ok(stderr)
    } else {
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{RemoteStream, StreamChunk};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Shell that replays a scripted [`ExecOutput`] for every command.
    struct ScriptedShell {
        output: Mutex<Option<ExecOutput>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedShell {
        fn new(stdout: &str, stderr: &str) -> Self {
            Self {
                output: Mutex::new(Some(ExecOutput {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                })),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteShell for ScriptedShell {
        async fn exec(&self, command: &str) -> Result<ExecOutput, Error> {
            self.seen.lock().unwrap().push(command.to_string());
            Ok(self.output.lock().unwrap().take().unwrap_or_default())
        }

        async fn open_stream(
            &self,
            _command: &str,
            _pty: bool,
        ) -> Result<Box<dyn RemoteStream>, Error> {
            struct Empty;
            #[async_trait]
            impl RemoteStream for Empty {
                async fn next_chunk(&mut self) -> Option<StreamChunk> {
                    None
                }
                async fn close(&mut self) {}
            }
            Ok(Box::new(Empty))
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_stdout_only_returns_stdout() {
        let shell = ScriptedShell::new("active\n", "");
        let out = execute(&shell, "systemctl is-active eth1").await.unwrap();
        assert_eq!(out, "active\n");
    }

    #[tokio::test]
    async fn test_stderr_only_fails() {
        let shell = ScriptedShell::new("", "Unit nope.service not found\n");
        let err = execute(&shell, "systemctl status nope").await.unwrap_err();
        match err {
            Error::CommandFailed(text) => assert!(text.contains("not found")),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_both_streams_prefers_stdout() {
        let shell = ScriptedShell::new("result\n", "warning: slow disk\n");
        let out = execute(&shell, "some-tool").await.unwrap();
        assert_eq!(out, "result\n");
    }

    #[tokio::test]
    async fn test_clone_concatenates_stdout_then_stderr() {
        let shell = ScriptedShell::new("Preparing...\n", "Cloning into 'ethpillar'...\ndone.\n");
        let out = execute(&shell, "git clone https://example.com/ethpillar.git")
            .await
            .unwrap();
        assert_eq!(out, "Preparing...\nCloning into 'ethpillar'...\ndone.\n");
    }

    #[tokio::test]
    async fn test_clone_with_only_stderr_still_succeeds() {
        let shell = ScriptedShell::new("", "Cloning into 'ethpillar'...\n");
        let out = execute(&shell, "git clone https://example.com/ethpillar.git")
            .await
            .unwrap();
        assert_eq!(out, "Cloning into 'ethpillar'...\n");
    }

    #[tokio::test]
    async fn test_command_is_wrapped_in_interactive_shell() {
        let shell = ScriptedShell::new("ok", "");
        execute(&shell, "ethpillar --version").await.unwrap();
        let seen = shell.seen.lock().unwrap();
        assert!(seen[0].starts_with("/bin/bash -i -c"));
        assert!(seen[0].contains("source ~/.bashrc 2>/dev/null; ethpillar --version"));
    }
}
