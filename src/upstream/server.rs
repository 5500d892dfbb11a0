//! A single supervised upstream MCP server.
//!
//! The child process is spawned with piped stdio: requests go down stdin as
//! newline-delimited JSON-RPC, responses come back on stdout, and stderr is
//! forwarded to the structured log. A server counts as connected once it
//! either emits a well-formed JSON-RPC line on stdout or prints a known
//! ready marker on stderr. On exit the child is respawned with bounded
//! exponential backoff unless the proxy is shutting down.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex, Notify};

use crate::config::{self, UpstreamSpec};
use crate::errors::AppError;
use crate::rpc::JsonRpcRequest;

/// Stderr substrings that mark a server ready before it has produced any
/// protocol output.
const READY_MARKERS: &[&str] = &["running on stdio", "server started", "listening"];

/// Restart backoff never exceeds this.
const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unstarted,
    Starting,
    Connected,
    Disconnected,
    Terminated,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Unstarted => "unstarted",
            ServerState::Starting => "starting",
            ServerState::Connected => "connected",
            ServerState::Disconnected => "disconnected",
            ServerState::Terminated => "terminated",
        }
    }
}

/// Per-stage deadlines for upstream communication.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamTimeouts {
    /// How long a request waits for a not-yet-connected server.
    pub init_deadline: Duration,
    /// Per-request deadline once connected.
    pub request_timeout: Duration,
    /// Per-server deadline inside aggregate fan-outs.
    pub fanout_timeout: Duration,
    /// Base delay before respawning a crashed child.
    pub restart_delay: Duration,
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self {
            init_deadline: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            fanout_timeout: Duration::from_secs(10),
            restart_delay: Duration::from_secs(5),
        }
    }
}

type Resolver = oneshot::Sender<Result<Value, AppError>>;

struct Inner {
    name: String,
    spec: UpstreamSpec,
    timeouts: UpstreamTimeouts,
    state: std::sync::RwLock<ServerState>,
    /// Connection flag; request() subscribes and waits for `true`.
    connected: watch::Sender<bool>,
    stdin: Mutex<Option<ChildStdin>>,
    inflight: std::sync::Mutex<HashMap<u64, Resolver>>,
    next_id: AtomicU64,
    shutdown: Notify,
    shutting_down: AtomicBool,
    /// Consecutive crashes since the last successful connection.
    crashes: AtomicU32,
}

impl Inner {
    fn set_state(&self, state: ServerState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    fn state(&self) -> ServerState {
        *self.state.read().expect("state lock poisoned")
    }

    fn mark_connected(&self) {
        if self.state() == ServerState::Connected {
            return;
        }
        self.set_state(ServerState::Connected);
        self.crashes.store(0, Ordering::Relaxed);
        // send_replace stores the flag even when nobody subscribes yet.
        self.connected.send_replace(true);
        tracing::info!(server = %self.name, "upstream connected");
    }

    /// Fail every in-flight request with a retriable error.
    fn fail_inflight(&self, reason: &str) {
        let mut table = self.inflight.lock().expect("inflight lock poisoned");
        for (_, tx) in table.drain() {
            let _ = tx.send(Err(AppError::UpstreamRetriable(format!(
                "upstream '{}' {}",
                self.name, reason
            ))));
        }
    }

    fn resolve(&self, id: u64, msg: &Value) {
        let tx = self
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(&id);
        let Some(tx) = tx else {
            tracing::debug!(server = %self.name, id, "response with no matching request");
            return;
        };
        let outcome = if let Some(err) = msg.get("error") {
            Err(AppError::Upstream(format!(
                "upstream '{}' error: {}",
                self.name, err
            )))
        } else {
            Ok(msg.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = tx.send(outcome);
    }
}

/// Handle to one supervised upstream server. Cheap to clone.
#[derive(Clone)]
pub struct UpstreamServer {
    inner: Arc<Inner>,
}

impl UpstreamServer {
    pub fn new(name: impl Into<String>, spec: UpstreamSpec, timeouts: UpstreamTimeouts) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                spec,
                timeouts,
                state: std::sync::RwLock::new(ServerState::Unstarted),
                connected,
                stdin: Mutex::new(None),
                inflight: std::sync::Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown: Notify::new(),
                shutting_down: AtomicBool::new(false),
                crashes: AtomicU32::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ServerState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ServerState::Connected
    }

    /// Spawn the child process and its reader/monitor tasks.
    pub async fn start(&self) -> Result<(), AppError> {
        self.spawn_process().await
    }

    async fn spawn_process(&self) -> Result<(), AppError> {
        let inner = &self.inner;
        inner.set_state(ServerState::Starting);

        let mut cmd = Command::new(&inner.spec.command);
        cmd.args(&inner.spec.args);
        for (key, value) in &inner.spec.env {
            cmd.env(key, config::expand_env(value));
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            inner.set_state(ServerState::Disconnected);
            AppError::Upstream(format!(
                "failed to spawn upstream '{}' ({}): {}",
                inner.name, inner.spec.command, e
            ))
        })?;

        let stdout = child.stdout.take().expect("child stdout piped");
        let stderr = child.stderr.take().expect("child stderr piped");
        let stdin = child.stdin.take().expect("child stdin piped");
        *inner.stdin.lock().await = Some(stdin);

        tracing::info!(
            server = %inner.name,
            command = %inner.spec.command,
            pid = child.id(),
            "upstream spawned"
        );

        tokio::spawn(read_stdout(inner.clone(), stdout));
        tokio::spawn(read_stderr(inner.clone(), stderr));
        tokio::spawn(monitor(self.clone(), child));
        Ok(())
    }

    /// Wait until the server is connected, up to `deadline`.
    pub async fn wait_connected(&self, deadline: Duration) -> Result<(), AppError> {
        if *self.inner.connected.borrow() && self.is_connected() {
            return Ok(());
        }
        let mut rx = self.inner.connected.subscribe();
        let result = match tokio::time::timeout(deadline, rx.wait_for(|c| *c)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(AppError::Timeout(format!(
                "upstream '{}' not ready within {:?}",
                self.inner.name, deadline
            ))),
        };
        result
    }

    /// Send one JSON-RPC request and await its response.
    ///
    /// Blocks up to the init deadline when the server has not connected yet.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, AppError> {
        let inner = &self.inner;
        if !self.is_connected() {
            self.wait_connected(inner.timeouts.init_deadline).await?;
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request)
            .map_err(|e| AppError::Validation(format!("unserializable request: {}", e)))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        inner
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .insert(id, tx);

        {
            let mut guard = inner.stdin.lock().await;
            let Some(writer) = guard.as_mut() else {
                inner
                    .inflight
                    .lock()
                    .expect("inflight lock poisoned")
                    .remove(&id);
                return Err(AppError::UpstreamRetriable(format!(
                    "upstream '{}' has no open stdin",
                    inner.name
                )));
            };
            let mut write_result = writer.write_all(line.as_bytes()).await;
            if write_result.is_ok() {
                write_result = writer.flush().await;
            }
            if let Err(e) = write_result {
                inner
                    .inflight
                    .lock()
                    .expect("inflight lock poisoned")
                    .remove(&id);
                return Err(AppError::UpstreamRetriable(format!(
                    "write to upstream '{}' failed: {}",
                    inner.name, e
                )));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AppError::UpstreamRetriable(format!(
                "upstream '{}' dropped mid-request",
                inner.name
            ))),
            Err(_) => {
                inner
                    .inflight
                    .lock()
                    .expect("inflight lock poisoned")
                    .remove(&id);
                Err(AppError::Timeout(format!(
                    "upstream '{}' did not answer {} within {:?}",
                    inner.name, method, timeout
                )))
            }
        }
    }

    /// Graceful shutdown: no restart, kill the child, fail in-flight.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_one();
        self.inner.fail_inflight("is shutting down");
        self.inner.connected.send_replace(false);
    }
}

// ── Child I/O tasks ──────────────────────────────────────────

async fn read_stdout(inner: Arc<Inner>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    // A partial line at end-of-stream never yields from next_line(), so it
    // is dropped as required.
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(msg) if msg.is_object() => {
                inner.mark_connected();
                if msg.get("method").is_some() {
                    // Server-initiated request or notification; the proxy
                    // does not relay these upstream-to-client.
                    tracing::debug!(
                        server = %inner.name,
                        method = %msg["method"],
                        "ignoring server-initiated message"
                    );
                    continue;
                }
                match msg.get("id").and_then(Value::as_u64) {
                    Some(id) => inner.resolve(id, &msg),
                    None => {
                        tracing::debug!(server = %inner.name, "response without usable id")
                    }
                }
            }
            _ => {
                tracing::debug!(server = %inner.name, line = %trimmed, "discarding non-JSON output");
            }
        }
    }
    tracing::debug!(server = %inner.name, "stdout closed");
}

async fn read_stderr(inner: Arc<Inner>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let lowered = line.to_lowercase();
        if READY_MARKERS.iter().any(|m| lowered.contains(m)) {
            inner.mark_connected();
        }
        tracing::debug!(server = %inner.name, "{}", line);
    }
}

fn monitor(
    server: UpstreamServer,
    mut child: Child,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
    let inner = server.inner.clone();
    tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            inner.set_state(ServerState::Disconnected);
            inner.connected.send_replace(false);
            *inner.stdin.lock().await = None;
            inner.fail_inflight("exited mid-request");

            if inner.shutting_down.load(Ordering::SeqCst) {
                inner.set_state(ServerState::Terminated);
                return;
            }

            let attempt = inner.crashes.fetch_add(1, Ordering::Relaxed);
            let delay = restart_delay(inner.timeouts.restart_delay, attempt);
            tracing::warn!(
                server = %inner.name,
                exit_code = ?code,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "upstream exited, scheduling restart"
            );

            tokio::time::sleep(delay).await;
            if inner.shutting_down.load(Ordering::SeqCst) {
                inner.set_state(ServerState::Terminated);
                return;
            }
            if let Err(e) = server.spawn_process().await {
                tracing::error!(server = %inner.name, error = %e, "upstream respawn failed");
            }
        }
        _ = inner.shutdown.notified() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            inner.set_state(ServerState::Terminated);
            tracing::info!(server = %inner.name, "upstream terminated");
        }
    }
    })
}

/// Bounded exponential backoff with jitter: base × 2^attempt, capped.
fn restart_delay(base: Duration, attempt: u32) -> Duration {
    use rand::Rng;
    let exp = base.saturating_mul(1u32 << attempt.min(4));
    let capped = exp.min(MAX_RESTART_DELAY);
    capped + Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

// ── Tests ────────────────────────────────────────────────────
