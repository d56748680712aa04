use std::process::Stdio;
use std::sync::{Arc, Mutex};

use thelma_core::{Result, ThelmaError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::{timeout, Duration};
use tracing::debug;

// ─── run_capture ─────────────────────────────────────────────────────────

/// Run `cmd` to completion and return its stdout. A non-zero exit becomes a
/// `Remote` error for `service` carrying the captured stderr.
pub async fn run_capture(mut cmd: Command, service: &str) -> Result<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(service, cmd = ?cmd.as_std(), "running");
    let out = cmd
        .output()
        .await
        .map_err(|e| ThelmaError::remote(service, format!("failed to start: {e}")))?;
    if !out.status.success() {
        return Err(exit_error(
            service,
            out.status.code(),
            String::from_utf8_lossy(&out.stderr).trim(),
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

fn exit_error(service: &str, code: Option<i32>, stderr: &str) -> ThelmaError {
    let head = match code {
        Some(code) => format!("exited with code {code}"),
        None => "terminated by signal".to_string(),
    };
    if stderr.is_empty() {
        ThelmaError::remote(service, head)
    } else {
        ThelmaError::remote(service, format!("{head}\nstderr: {stderr}"))
    }
}

// ─── ForwardProcess ──────────────────────────────────────────────────────

/// A running `kubectl port-forward`.
///
/// The child is killed when [`ForwardProcess::kill`] is called or when the
/// value is dropped (via `kill_on_drop(true)`).
pub struct ForwardProcess {
    pub local_port: u16,
    child: Child,
}

impl ForwardProcess {
    /// Spawn `cmd` and wait until it reports the local port it bound.
    pub async fn start(mut cmd: Command, wait: Duration) -> Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| ThelmaError::remote("kubectl", format!("failed to start port-forward: {e}")))?;

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            let buf = Arc::clone(&stderr_buf);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if let Ok(mut b) = buf.lock() {
                        if !b.is_empty() {
                            b.push('\n');
                        }
                        b.push_str(&line);
                    }
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ThelmaError::remote("kubectl", "stdout not captured"))?;

        match timeout(wait, read_local_port(stdout)).await {
            Ok(Some((local_port, rest))) => {
                // kubectl logs every connection; keep reading so it never
                // blocks on a full pipe.
                tokio::spawn(async move {
                    let mut reader = rest;
                    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                });
                debug!(local_port, "port-forward ready");
                Ok(Self { local_port, child })
            }
            Ok(None) => {
                let status = child.wait().await.ok();
                let stderr = stderr_buf.lock().map(|b| b.clone()).unwrap_or_default();
                Err(exit_error(
                    "kubectl",
                    status.and_then(|s| s.code()),
                    stderr.trim(),
                ))
            }
            Err(_elapsed) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                Err(ThelmaError::Timeout {
                    what: "port-forward to report its local port".into(),
                    seconds: wait.as_secs(),
                })
            }
        }
    }

    /// Signal the child to exit without waiting for it.
    pub fn kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

async fn read_local_port(stdout: ChildStdout) -> Option<(u16, BufReader<ChildStdout>)> {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {
                if let Some(port) = parse_forwarding_port(&line) {
                    return Some((port, reader));
                }
            }
        }
    }
}

/// Parse `Forwarding from 127.0.0.1:41233 -> 9200`.
pub fn parse_forwarding_port(line: &str) -> Option<u16> {
    let rest = line.trim().strip_prefix("Forwarding from ")?;
    let addr = rest.split_whitespace().next()?;
    addr.rsplit_once(':')?.1.parse().ok()
}
