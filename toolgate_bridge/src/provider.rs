//! Subprocess RPC client.
//!
//! One [`ProviderClient`] owns one provider subprocess. Requests are written to
//! the child's stdin as single-line JSON envelopes; a reader task owns the
//! child's stdout, frames it into lines with [`LineCodec`], validates each line
//! into a [`Reply`] and completes the pending slot registered under the reply's
//! id. Callers only ever wait on their own slot, so concurrent calls to one
//! provider are fully interleaved and replies may arrive in any order.
//!
//! ## Pending slots
//!
//! Every call registers a one-shot slot in a `DashMap` before its request is
//! written. Whoever removes the entry resolves it: the reader (reply), the
//! shutdown path (`ExecutionError`), or the caller itself on timeout or when
//! its future is dropped. `DashMap::remove` hands the entry to exactly one of
//! them, so a slot is never resolved twice and never outlives its call.
//!
//! ## Lifecycle
//!
//! `Unstarted → Starting → Ready → Stopped`, tracked by
//! [`toolgate_common::lifecycle::Lifecycle`]. Calls are only accepted in `Ready`.

use crate::config::{DEFAULT_CALL_TIMEOUT, DEFAULT_START_GRACE, ProviderSpec};
use crate::error::{GatewayError, Result};
use crate::path_guard::PathGuard;
use chrono::Local;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use owo_colors::OwoColorize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use toolgate_common::codec::{LineCodec, LineFrame};
use toolgate_common::lifecycle::{Lifecycle, ProviderState};
use toolgate_common::protocol::{Reply, Request};
use tracing::{debug, error, info, warn};

type Outcome = Result<Value>;
type PendingMap = DashMap<u64, oneshot::Sender<Outcome>>;
type LineSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LineCodec>;

/// File extensions treated as interpreter scripts whose presence is checked
/// before launch.
const SCRIPT_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "ts", "py", "rb", "sh", "pl"];

/// Everything needed to launch a provider subprocess.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub spec: ProviderSpec,
    pub working_dir: PathBuf,
    /// Execution-scoped settings exported to the child
    pub env: Vec<(String, String)>,
    pub guard: Arc<PathGuard>,
    pub call_timeout: Duration,
    pub start_grace: Duration,
    pub colored_output: bool,
}

impl LaunchOptions {
    pub fn new(spec: ProviderSpec, working_dir: impl Into<PathBuf>, guard: Arc<PathGuard>) -> Self {
        Self {
            spec,
            working_dir: working_dir.into(),
            env: Vec::new(),
            guard,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            start_grace: DEFAULT_START_GRACE,
            colored_output: false,
        }
    }
}

pub struct ProviderClient {
    name: String,
    options: Option<LaunchOptions>,
    lifecycle: Lifecycle,
    next_id: AtomicU64,
    pending: Arc<PendingMap>,
    writer: Mutex<Option<LineSink>>,
    child: Mutex<Option<Child>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    call_timeout: Duration,
    colored_output: bool,
}

impl ProviderClient {
    /// Creates an unstarted client for a subprocess provider.
    pub fn new(name: impl Into<String>, options: LaunchOptions) -> Self {
        let call_timeout = options.call_timeout;
        let colored_output = options.colored_output;
        Self::build(name.into(), Some(options), call_timeout, colored_output)
    }

    /// Creates a ready client speaking the protocol over arbitrary streams
    /// instead of a subprocess.
    pub fn attach<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        call_timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let client = Self::build(name.into(), None, call_timeout, false);
        let _ = client.lifecycle.begin_start();
        client.install_transport(reader, Box::new(writer), None);
        let _ = client.lifecycle.mark_ready();
        client
    }

    fn build(
        name: String,
        options: Option<LaunchOptions>,
        call_timeout: Duration,
        colored_output: bool,
    ) -> Self {
        Self {
            name,
            options,
            lifecycle: Lifecycle::new(),
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            writer: Mutex::new(None),
            child: Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
            call_timeout,
            colored_output,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProviderState {
        self.lifecycle.current()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle.is_ready()
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Launches the subprocess and waits until it is usable.
    ///
    /// A missing executable or script is reported as `ProviderNotFound` and
    /// leaves the client `Stopped` for good.
    pub async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start().map_err(|e| {
            GatewayError::NotStarted(format!("{}: {}", self.name, e))
        })?;

        match self.launch().await {
            Ok(()) => {
                info!(provider = %self.name, "Provider ready");
                Ok(())
            }
            Err(e) => {
                warn!(provider = %self.name, "Provider failed to start: {}", e);
                self.shutdown(&format!("start failed: {e}")).await;
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<()> {
        let options = self.options.as_ref().ok_or_else(|| {
            GatewayError::NotStarted(format!("{} has no launch configuration", self.name))
        })?;

        let working_dir = options.guard.resolve(&options.working_dir)?;
        let program = locate_executable(&self.name, &options.spec, &working_dir)?;

        info!(
            provider = %self.name,
            program = %program.display(),
            args = ?options.spec.args,
            working_dir = %working_dir.display(),
            "Launching provider"
        );

        let mut child = Command::new(&program)
            .args(&options.spec.args)
            .current_dir(&working_dir)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(&options.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The subprocess must never outlive its client
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::ExecutionError(format!("failed to spawn {}: {}", self.name, e))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(GatewayError::ExecutionError(format!(
                "{}: subprocess pipes unavailable",
                self.name
            )));
        };

        self.install_transport(stdout, Box::new(stdin), stderr);
        *self.child.lock().await = Some(child);

        tokio::time::sleep(options.start_grace).await;

        if let Some(child) = self.child.lock().await.as_mut()
            && let Ok(Some(status)) = child.try_wait()
        {
            return Err(GatewayError::ExecutionError(format!(
                "{} exited during startup ({})",
                self.name, status
            )));
        }

        if let Some(method) = &options.spec.ready_method {
            debug!(provider = %self.name, method = %method, "Probing provider readiness");
            self.request(method, Value::Object(Default::default()))
                .await
                .map_err(|e| {
                    GatewayError::ExecutionError(format!(
                        "{} failed readiness probe '{}': {}",
                        self.name, method, e
                    ))
                })?;
        }

        self.lifecycle.mark_ready().map_err(|_| {
            GatewayError::ExecutionError(format!("{} stopped during startup", self.name))
        })
    }

    fn install_transport<R>(
        &self,
        reader: R,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        stderr: Option<tokio::process::ChildStderr>,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let sink = FramedWrite::new(writer, LineCodec::new());
        // Nothing else can hold the writer lock before the transport exists.
        if let Ok(mut slot) = self.writer.try_lock() {
            *slot = Some(sink);
        }

        let mut handles = Vec::with_capacity(2);
        handles.push(tokio::spawn(read_replies(
            self.name.clone(),
            reader,
            self.pending.clone(),
            self.lifecycle.clone(),
            self.colored_output,
        )));
        if let Some(stderr) = stderr {
            handles.push(tokio::spawn(drain_stderr(
                self.name.clone(),
                stderr,
                self.colored_output,
            )));
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
    }

    /// Invokes `method` on the provider and waits for its reply.
    ///
    /// Fails with `NotStarted` unless the client is ready, `Timeout` when no
    /// reply arrives in time and `ExecutionError` when the provider reports an
    /// error or exits first.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        match self.lifecycle.current() {
            ProviderState::Ready => self.request(method, params).await,
            state => Err(GatewayError::NotStarted(format!(
                "{} is {}",
                self.name,
                state.label()
            ))),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = Request::new(id, method, params).to_line()?;

        let (slot, completion) = oneshot::channel();
        self.pending.insert(id, slot);
        let _release = PendingRelease {
            pending: &self.pending,
            id,
        };

        if self.colored_output {
            echo(&self.name, Pipe::Stdin, &line);
        }
        debug!(provider = %self.name, request_id = id, method = %method, "Sending request");

        // The deadline covers the write too: a provider that stops reading
        // stdin must not park callers on a full pipe.
        let exchange = async {
            self.send_line(line).await?;
            completion.await.map_err(|_| {
                GatewayError::ExecutionError(format!("{} dropped request {}", self.name, id))
            })?
        };

        match tokio::time::timeout(self.call_timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    provider = %self.name,
                    request_id = id,
                    method = %method,
                    "Provider call timed out"
                );
                Err(GatewayError::Timeout {
                    provider: self.name.clone(),
                    method: method.to_string(),
                    timeout: self.call_timeout,
                })
            }
        }
    }

    async fn send_line(&self, line: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or_else(|| {
            GatewayError::ExecutionError(format!("{} input is closed", self.name))
        })?;
        sink.send(line).await.map_err(|e| {
            error!(provider = %self.name, "Failed to write to provider: {}", e);
            GatewayError::ExecutionError(format!("failed to write to {}: {}", self.name, e))
        })
    }

    /// Terminates the subprocess and fails every outstanding call.
    pub async fn stop(&self) {
        self.shutdown("stopped by gateway").await;
    }

    async fn shutdown(&self, reason: &str) {
        if self.lifecycle.mark_stopped(reason) {
            info!(provider = %self.name, reason = %reason, "Stopping provider");
        }

        // Dropping the sink closes the child's stdin.
        self.writer.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take()
            && let Err(e) = child.kill().await
        {
            debug!(provider = %self.name, "Kill failed (already exited?): {}", e);
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        fail_pending(&self.name, &self.pending, reason);
    }
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("name", &self.name)
            .field("state", &self.lifecycle.current())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Removes a call's pending slot when the call ends, however it ends.
struct PendingRelease<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingRelease<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn read_replies<R>(
    name: String,
    reader: R,
    pending: Arc<PendingMap>,
    lifecycle: Lifecycle,
    colored_output: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, LineCodec::new());

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(LineFrame::Line(line)) => {
                if colored_output {
                    echo(&name, Pipe::Stdout, &line);
                }
                dispatch_line(&name, &line, &pending);
            }
            Ok(LineFrame::Invalid { reason, preview }) => {
                warn!(
                    provider = %name,
                    reason = %reason,
                    preview = %preview,
                    "Discarding provider output"
                );
            }
            Err(e) => {
                error!(provider = %name, "Failed to read provider output: {}", e);
                break;
            }
        }
    }

    let reason = "provider exited";
    if lifecycle.mark_stopped(reason) {
        warn!(provider = %name, "Provider output closed - assuming exit");
    }
    fail_pending(&name, &pending, reason);
}

/// Routes one complete output line to the caller waiting on its id.
fn dispatch_line(name: &str, line: &str, pending: &PendingMap) {
    let reply = match Reply::parse(line) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(provider = %name, line = %line, "Discarding malformed reply: {}", e);
            return;
        }
    };

    let id = reply.id;
    match pending.remove(&id) {
        Some((_, slot)) => {
            debug!(provider = %name, request_id = id, "Reply received");
            let outcome = reply.into_result().map_err(|e| {
                GatewayError::ExecutionError(format!("{name} returned an error: {e}"))
            });
            // The caller may have given up in the meantime.
            let _ = slot.send(outcome);
        }
        None => {
            warn!(provider = %name, request_id = id, "Reply for unknown or expired request");
        }
    }
}

fn fail_pending(name: &str, pending: &PendingMap, reason: &str) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    if !ids.is_empty() {
        warn!(
            provider = %name,
            pending_count = ids.len(),
            "Failing outstanding calls: {}",
            reason
        );
    }
    for id in ids {
        if let Some((_, slot)) = pending.remove(&id) {
            let _ = slot.send(Err(GatewayError::ExecutionError(format!(
                "{name}: {reason} before replying to request {id}"
            ))));
        }
    }
}

async fn drain_stderr(name: String, stderr: tokio::process::ChildStderr, colored_output: bool) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => {
                if colored_output {
                    echo(&name, Pipe::Stderr, &line);
                }
                debug!(provider = %name, "stderr: {}", line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(provider = %name, "stderr closed: {}", e);
                break;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Pipe {
    Stdin,
    Stdout,
    Stderr,
}

/// Colored stdio echo for interactive debugging.
fn echo(name: &str, pipe: Pipe, text: &str) {
    let timestamp = format!("[{}]", Local::now().format("%H:%M:%S%.3f"));
    let tag = format!("[{name}]");
    let pretty = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| text.to_string());
    match pipe {
        Pipe::Stdin => eprintln!(
            "{} {} {}\n{}",
            timestamp,
            tag.cyan(),
            "→ STDIN:".cyan(),
            pretty.cyan()
        ),
        Pipe::Stdout => eprintln!(
            "{} {} {}\n{}",
            timestamp,
            tag.green(),
            "← STDOUT:".green(),
            pretty.green()
        ),
        Pipe::Stderr => eprintln!(
            "{} {} {}\n{}",
            timestamp,
            tag.red(),
            "⚠ STDERR:".red(),
            pretty.red()
        ),
    }
}

/// Resolves the provider's executable, and its script argument when the
/// executable is an interpreter.
fn locate_executable(name: &str, spec: &ProviderSpec, working_dir: &Path) -> Result<PathBuf> {
    let not_found = |what: String| GatewayError::ProviderNotFound(format!("{name}: {what}"));

    let command = Path::new(&spec.command);
    let program = if command.components().count() > 1 {
        let candidate = if command.is_absolute() {
            command.to_path_buf()
        } else {
            working_dir.join(command)
        };
        if !candidate.is_file() {
            return Err(not_found(format!(
                "executable {} does not exist",
                candidate.display()
            )));
        }
        candidate
    } else {
        which::which(&spec.command)
            .map_err(|e| not_found(format!("cannot locate '{}': {}", spec.command, e)))?
    };

    if let Some(script) = script_argument(&spec.args) {
        let script_path = working_dir.join(script);
        if !script_path.is_file() {
            return Err(not_found(format!(
                "script {} does not exist",
                script_path.display()
            )));
        }
    }

    Ok(program)
}

fn script_argument(args: &[String]) -> Option<&str> {
    let first = args.first()?;
    if first.starts_with('-') {
        return None;
    }
    let extension = Path::new(first).extension()?.to_str()?;
    SCRIPT_EXTENSIONS
        .contains(&extension)
        .then_some(first.as_str())
}
