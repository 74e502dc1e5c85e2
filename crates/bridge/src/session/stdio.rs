//! Local subprocess transport: line-framed JSON-RPC over stdio.
//!
//! The session owns the child process. Stdout is strictly JSON-RPC, one
//! message per line. Stderr is captured line-buffered and routed to the
//! operator log with the backend name attached; it must never reach the
//! terminal directly.

use super::rpc::{self, CallGate, RequestTracker};
use super::{BackendSession, SessionError};
use crate::config::StdioConnect;
use async_trait::async_trait;
use manifold_wire as wire;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct StdioSession {
    name: String,
    tracker: Arc<RequestTracker>,
    gate: CallGate,
    write_tx: mpsc::UnboundedSender<String>,
    child: parking_lot::Mutex<Option<Child>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl StdioSession {
    /// Spawn the child process and its reader/writer/stderr tasks.
    pub fn spawn(
        name: &str,
        connect: &StdioConnect,
        max_outstanding: usize,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, SessionError> {
        let mut cmd = Command::new(&connect.command);
        cmd.args(&connect.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &connect.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            SessionError::Transport(format!("failed to spawn '{}': {e}", connect.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Transport("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Transport("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::Transport("child stderr unavailable".to_string()))?;

        let cancel = shutdown.child_token();
        let tracker = Arc::new(RequestTracker::new());
        let (write_tx, write_rx) = mpsc::unbounded_channel::<String>();

        let session = Arc::new(Self {
            name: name.to_string(),
            tracker: tracker.clone(),
            gate: CallGate::new(max_outstanding),
            write_tx,
            child: parking_lot::Mutex::new(Some(child)),
            cancel: cancel.clone(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(writer_task(stdin, write_rx, cancel.clone()));
        tokio::spawn(reader_task(
            name.to_string(),
            stdout,
            tracker,
            session.write_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(stderr_task(name.to_string(), stderr, cancel));

        Ok(session)
    }

    fn send_line(&self, line: String) -> Result<(), SessionError> {
        self.write_tx
            .send(line)
            .map_err(|_| SessionError::Transport("stdin writer gone".to_string()))
    }
}

#[async_trait]
impl BackendSession for StdioSession {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> Result<Value, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let _permit = self.gate.acquire(deadline).await?;
        let started = Instant::now();

        // The slot unregisters itself on drop, so timeouts and callers that
        // vanish mid-await leave nothing behind.
        let mut pending = self.tracker.register();
        let req = wire::Request::new(wire::RequestId::Number(pending.id()), method, params);
        let line = serde_json::to_string(&req)
            .map_err(|e| SessionError::InvalidResponse(format!("encode request: {e}")))?;
        self.send_line(line)?;

        match rpc::await_response(&mut pending, deadline, started).await {
            Ok(v) => Ok(v),
            Err(err) => {
                if matches!(err, SessionError::Timeout { .. }) {
                    // Correlated cancel so the backend can stop working on it.
                    let cancel = wire::Notification::new(
                        "notifications/cancelled",
                        Some(serde_json::json!({ "requestId": pending.id() })),
                    );
                    if let Ok(line) = serde_json::to_string(&cancel) {
                        let _ = self.send_line(line);
                    }
                }
                Err(err)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let notif = wire::Notification::new(method, params);
        let line = serde_json::to_string(&notif)
            .map_err(|e| SessionError::InvalidResponse(format!("encode notification: {e}")))?;
        self.send_line(line)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.tracker.fail_all(&SessionError::Closed);

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                tracing::debug!(backend = %self.name, error = %e, "child already gone");
            }
            let _ = child.wait().await;
            tracing::debug!(backend = %self.name, "child process reaped");
        }
    }
}

async fn writer_task(
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            maybe = rx.recv() => {
                let Some(mut line) = maybe else { break };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn reader_task(
    name: String,
    stdout: tokio::process::ChildStdout,
    tracker: Arc<RequestTracker>,
    write_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            res = lines.next_line() => match res {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracker.fail_all(&SessionError::Transport(
                        "backend closed stdout".to_string(),
                    ));
                    break;
                }
                Err(e) => {
                    tracker.fail_all(&SessionError::Transport(format!("stdout read: {e}")));
                    break;
                }
            },
        };

        if line.trim().is_empty() {
            continue;
        }

        match wire::Message::from_str(&line) {
            Ok(wire::Message::Response(resp)) => {
                let wire::RequestId::Number(id) = resp.id else {
                    tracing::debug!(backend = %name, "response with non-numeric id ignored");
                    continue;
                };
                let _ = tracker.complete(id, rpc::response_into_result(resp));
            }
            Ok(wire::Message::Notification(n)) => {
                tracing::debug!(backend = %name, method = %n.method, "backend notification");
            }
            Ok(wire::Message::Request(req)) => {
                // Server-to-client requests are out of contract for the
                // bridge; answer so the backend does not hang on us.
                let resp = wire::Response::err(
                    req.id,
                    wire::ErrorObject {
                        code: wire::CODE_METHOD_NOT_FOUND,
                        message: format!("method '{}' not supported by gateway", req.method),
                        data: None,
                    },
                );
                if let Ok(line) = serde_json::to_string(&resp) {
                    let _ = write_tx.send(line);
                }
            }
            Err(e) => {
                tracing::warn!(backend = %name, error = %e, "non-JSON-RPC line on stdout");
            }
        }
    }
}

/// Forward every stderr line to the operator log. Letting backend stderr hit
/// the terminal would corrupt any colocated UI, so this capture is a
/// correctness requirement.
async fn stderr_task(
    name: String,
    stderr: tokio::process::ChildStderr,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            res = lines.next_line() => match res {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        tracing::info!(backend = %name, stream = "stderr", "{}", line);
                    }
                }
                Ok(None) | Err(_) => break,
            },
        }
    }
}
