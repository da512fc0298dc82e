//! Stream providers: stdio and child-process pipe pairs.
//!
//! The connection driver only wants an `AsyncRead`/`AsyncWrite` pair;
//! these helpers produce the two pairs editor tooling actually uses. Any
//! other pair (named pipes, sockets, an in-memory duplex) plugs into
//! `Connection::connect` directly.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{RpcError, RpcResult};

/// Process-wide stdin/stdout pair, for running as the spawned side of a
/// connection.
pub fn stdio() -> (tokio::io::Stdin, tokio::io::Stdout) {
    (tokio::io::stdin(), tokio::io::stdout())
}

/// A peer launched as a child process, speaking the protocol over its
/// piped stdin/stdout. Stderr is drained to the log.
pub struct ChildProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stdin: Option<ChildStdin>,
}

impl ChildProcess {
    /// Spawn `command` with piped stdio. Must be called on a runtime; the
    /// stderr forwarder starts immediately.
    pub fn spawn(command: &str, args: &[&str]) -> RpcResult<Self> {
        log::debug!("spawning peer process: {} {:?}", command, args);
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        tokio::spawn(stderr_loop(stderr));

        Ok(Self {
            child,
            stdout: Some(stdout),
            stdin: Some(stdin),
        })
    }

    /// Take the (read, write) pair for `Connection::connect`.
    pub fn streams(&mut self) -> RpcResult<(ChildStdout, ChildStdin)> {
        let stdout = self.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stdin = self.stdin.take().ok_or_else(|| missing("stdin"))?;
        Ok((stdout, stdin))
    }

    /// Wait for the child to exit on its own, killing it after 5 seconds.
    pub async fn shutdown(mut self) -> RpcResult<()> {
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(status) => {
                log::debug!("peer process exited: {:?}", status?);
            }
            Err(_) => {
                log::warn!("peer process did not exit, killing");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

fn missing(stream: &str) -> RpcError {
    RpcError::Io(std::io::Error::other(format!(
        "child process {} not available",
        stream
    )))
}

/// Forward the child's stderr lines to the log until EOF.
async fn stderr_loop(stderr: tokio::process::ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    log::warn!("peer stderr: {}", trimmed);
                }
            }
            Err(err) => {
                log::debug!("error reading peer stderr: {}", err);
                break;
            }
        }
    }
}
