//! Bounded pool of interactive shell sessions.
//!
//! Each [`TerminalSession`] owns one shell running in a pseudo-terminal. The
//! pool caps the number of live sessions, evicts sessions nobody has touched
//! for a while, and removes sessions whose shell exits on its own.
//!
//! All map mutations and every write/resize/dispose happen while the single
//! sessions mutex is held, so a dispose can never interleave with a write to
//! the same session.

use crate::error::{GatewayError, Result};
use crate::path_guard::PathGuard;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_SESSIONS: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// How long [`TerminalPool::write_input`] waits for a backed-up shell.
pub const INPUT_WAIT: Duration = Duration::from_secs(5);
const INPUT_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// What a [`TerminalSpawner`] needs to start one shell.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub shell: String,
    pub working_dir: PathBuf,
    pub size: TerminalSize,
    pub env: Vec<(String, String)>,
}

/// A running shell attached to a pseudo-terminal.
pub trait TerminalProcess: Send + Sync {
    /// Queues bytes for the shell's input. Fails with `TerminalBusy` while
    /// the queue is full.
    fn write(&self, data: &[u8]) -> Result<()>;

    fn resize(&self, size: TerminalSize) -> Result<()>;

    /// Output published after this call; chunks are delivered in order.
    fn subscribe(&self) -> broadcast::Receiver<Bytes>;

    /// Flips to `true` once the shell has exited and its output is drained.
    fn exited(&self) -> watch::Receiver<bool>;

    /// Terminates the shell. Calling it more than once is harmless.
    fn kill(&self);
}

pub trait TerminalSpawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn TerminalProcess>>;
}

/// Public description of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub cols: u16,
    pub rows: u16,
}

/// Optional parameters of [`TerminalPool::create`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateTerminal {
    pub name: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

pub struct TerminalSession {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    size: Mutex<TerminalSize>,
    process: Box<dyn TerminalProcess>,
}

impl TerminalSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn size(&self) -> TerminalSize {
        *lock(&self.size)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.process.subscribe()
    }

    pub fn exited(&self) -> watch::Receiver<bool> {
        self.process.exited()
    }

    /// Refreshes the activity timestamp. It never moves backwards.
    pub fn touch(&self) {
        let now = Instant::now();
        let mut last = lock(&self.last_activity);
        if now > *last {
            *last = now;
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock(&self.last_activity))
    }

    pub fn info(&self) -> TerminalInfo {
        let size = self.size();
        TerminalInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            cols: size.cols,
            rows: size.rows,
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.touch();
        self.process.write(data)
    }

    fn resize(&self, size: TerminalSize) -> Result<()> {
        self.touch();
        self.process.resize(size)?;
        *lock(&self.size) = size;
        Ok(())
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.process.kill();
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TerminalPoolConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub shell: String,
    pub working_dir: PathBuf,
}

impl TerminalPoolConfig {
    pub fn new(shell: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            shell: shell.into(),
            working_dir: working_dir.into(),
        }
    }
}

/// Picks the configured shell, then `$SHELL`, then `/bin/sh`.
pub fn resolve_shell(configured: Option<&str>) -> String {
    configured
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct TerminalPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: TerminalPoolConfig,
    spawner: Arc<dyn TerminalSpawner>,
    guard: Arc<PathGuard>,
    sessions: Mutex<HashMap<String, Arc<TerminalSession>>>,
    created: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalPool {
    pub fn new(
        config: TerminalPoolConfig,
        spawner: Arc<dyn TerminalSpawner>,
        guard: Arc<PathGuard>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                spawner,
                guard,
                sessions: Mutex::new(HashMap::new()),
                created: AtomicU64::new(0),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &TerminalPoolConfig {
        &self.inner.config
    }

    /// Starts a shell session and returns its id and name.
    pub fn create(&self, options: CreateTerminal) -> Result<TerminalInfo> {
        let inner = &self.inner;
        let working_dir = inner.guard.resolve(&inner.config.working_dir)?;
        let size = TerminalSize {
            cols: options.cols.filter(|c| *c > 0).unwrap_or(TerminalSize::default().cols),
            rows: options.rows.filter(|r| *r > 0).unwrap_or(TerminalSize::default().rows),
        };

        let session = {
            let mut sessions = lock(&inner.sessions);
            if sessions.len() >= inner.config.max_sessions {
                warn!(
                    limit = inner.config.max_sessions,
                    "Refusing terminal: session limit reached"
                );
                return Err(GatewayError::CapacityExceeded {
                    limit: inner.config.max_sessions,
                });
            }

            let process = inner.spawner.spawn(SpawnRequest {
                shell: inner.config.shell.clone(),
                working_dir,
                size,
                env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            })?;

            let ordinal = inner.created.fetch_add(1, Ordering::Relaxed) + 1;
            let session = Arc::new(TerminalSession {
                id: Uuid::new_v4().to_string(),
                name: options
                    .name
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| format!("terminal-{ordinal}")),
                created_at: Utc::now(),
                last_activity: Mutex::new(Instant::now()),
                size: Mutex::new(size),
                process,
            });
            sessions.insert(session.id.clone(), session.clone());
            session
        };

        info!(
            session_id = %session.id,
            name = %session.name,
            shell = %inner.config.shell,
            "Terminal session created"
        );
        self.watch_exit(&session);
        Ok(session.info())
    }

    fn watch_exit(&self, session: &TerminalSession) {
        let pool = Arc::downgrade(&self.inner);
        let id = session.id.clone();
        let mut exited = session.exited();
        tokio::spawn(async move {
            while !*exited.borrow_and_update() {
                if exited.changed().await.is_err() {
                    break;
                }
            }
            if let Some(inner) = pool.upgrade()
                && lock(&inner.sessions).remove(&id).is_some()
            {
                info!(session_id = %id, "Shell exited - terminal session removed");
            }
        });
    }

    /// Looks a session up and marks it active.
    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        let sessions = lock(&self.inner.sessions);
        let session = sessions.get(id)?;
        session.touch();
        Some(session.clone())
    }

    pub fn list(&self) -> Vec<TerminalInfo> {
        let mut infos: Vec<TerminalInfo> = lock(&self.inner.sessions)
            .values()
            .map(|s| s.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        infos
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends input to a session without waiting. Returns `false` when the
    /// session is unknown, its input is closed, or its input queue is full.
    pub fn write(&self, id: &str, data: &[u8]) -> bool {
        match self.try_write(id, data) {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %id, "Terminal write failed: {}", e);
                false
            }
        }
    }

    /// Sends input to a session, waiting up to [`INPUT_WAIT`] for room in its
    /// input queue.
    ///
    /// Fails with `TerminalNotFound` for unknown ids, `TerminalBusy` when the
    /// shell stays backed up, and `ExecutionError` once its input is closed.
    pub async fn write_input(&self, id: &str, data: &[u8]) -> Result<()> {
        let deadline = Instant::now() + INPUT_WAIT;
        loop {
            match self.try_write(id, data) {
                Err(GatewayError::TerminalBusy(_)) if Instant::now() < deadline => {
                    tokio::time::sleep(INPUT_RETRY_DELAY).await;
                }
                Err(GatewayError::TerminalBusy(reason)) => {
                    warn!(session_id = %id, "Terminal input backed up: {}", reason);
                    return Err(GatewayError::TerminalBusy(id.to_string()));
                }
                other => return other,
            }
        }
    }

    fn try_write(&self, id: &str, data: &[u8]) -> Result<()> {
        let sessions = lock(&self.inner.sessions);
        let session = sessions
            .get(id)
            .ok_or_else(|| GatewayError::TerminalNotFound(id.to_string()))?;
        session.write(data)
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> bool {
        if cols == 0 || rows == 0 {
            return false;
        }
        let sessions = lock(&self.inner.sessions);
        let Some(session) = sessions.get(id) else {
            return false;
        };
        match session.resize(TerminalSize { cols, rows }) {
            Ok(()) => {
                debug!(session_id = %id, cols, rows, "Terminal resized");
                true
            }
            Err(e) => {
                warn!(session_id = %id, "Terminal resize failed: {}", e);
                false
            }
        }
    }

    /// Kills a session's shell and forgets it. Returns `false` if it was
    /// already gone.
    pub fn dispose(&self, id: &str) -> bool {
        let mut sessions = lock(&self.inner.sessions);
        match sessions.remove(id) {
            Some(session) => {
                session.process.kill();
                info!(session_id = %id, "Terminal session disposed");
                true
            }
            None => false,
        }
    }

    pub fn dispose_all(&self) -> usize {
        if let Some(sweeper) = lock(&self.inner.sweeper).take() {
            sweeper.abort();
        }
        let mut sessions = lock(&self.inner.sessions);
        let count = sessions.len();
        for (_, session) in sessions.drain() {
            session.process.kill();
        }
        if count > 0 {
            info!(count, "All terminal sessions disposed");
        }
        count
    }

    /// Disposes every session idle for longer than the configured threshold.
    pub fn sweep_idle(&self) -> Vec<String> {
        self.inner.sweep_idle()
    }

    /// Spawns the periodic idle sweep. Calling it again replaces the sweeper.
    pub fn start_sweeper(&self) {
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                inner.sweep_idle();
            }
        });
        if let Some(previous) = lock(&self.inner.sweeper).replace(handle) {
            previous.abort();
        }
    }
}

impl PoolInner {
    fn sweep_idle(&self) -> Vec<String> {
        let now = Instant::now();
        let mut sessions = lock(&self.sessions);
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.idle_for(now) > self.config.idle_timeout)
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                info!(
                    session_id = %id,
                    name = %session.name,
                    idle_secs = session.idle_for(now).as_secs(),
                    "Evicting idle terminal session"
                );
                session.process.kill();
            }
        }
        expired
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeTerminalSpawner;
    use tempfile::TempDir;

    fn pool_in(dir: &TempDir) -> (TerminalPool, Arc<FakeTerminalSpawner>) {
        let spawner = Arc::new(FakeTerminalSpawner::default());
        let pool = TerminalPool::new(
            TerminalPoolConfig::new("/bin/sh", dir.path()),
            spawner.clone(),
            Arc::new(PathGuard::new([dir.path()])),
        );
        (pool, spawner)
    }

    #[tokio::test]
    async fn default_names_are_numbered() {
        let dir = TempDir::new().unwrap();
        let (pool, _) = pool_in(&dir);
        let first = pool.create(CreateTerminal::default()).unwrap();
        let second = pool
            .create(CreateTerminal {
                name: Some("build".into()),
                ..Default::default()
            })
            .unwrap();
        let third = pool.create(CreateTerminal::default()).unwrap();
        assert_eq!(first.name, "terminal-1");
        assert_eq!(second.name, "build");
        assert_eq!(third.name, "terminal-3");
        assert_ne!(first.id, third.id);
    }

    #[tokio::test]
    async fn geometry_defaults_to_80_by_24() {
        let dir = TempDir::new().unwrap();
        let (pool, spawner) = pool_in(&dir);
        let info = pool.create(CreateTerminal::default()).unwrap();
        assert_eq!((info.cols, info.rows), (80, 24));
        assert_eq!(spawner.last_request().unwrap().size, TerminalSize::default());
    }

    #[tokio::test]
    async fn working_dir_outside_roots_is_rejected() {
        let allowed = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let pool = TerminalPool::new(
            TerminalPoolConfig::new("/bin/sh", other.path()),
            Arc::new(FakeTerminalSpawner::default()),
            Arc::new(PathGuard::new([allowed.path()])),
        );
        assert!(matches!(
            pool.create(CreateTerminal::default()),
            Err(GatewayError::PathNotAllowed { .. })
        ));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn resize_rejects_zero_geometry() {
        let dir = TempDir::new().unwrap();
        let (pool, _) = pool_in(&dir);
        let info = pool.create(CreateTerminal::default()).unwrap();
        assert!(!pool.resize(&info.id, 0, 10));
        assert!(pool.resize(&info.id, 120, 40));
        assert_eq!(pool.get(&info.id).unwrap().size(), TerminalSize { cols: 120, rows: 40 });
    }

    #[test]
    fn configured_shell_wins() {
        assert_eq!(resolve_shell(Some("/bin/zsh")), "/bin/zsh");
        assert!(!resolve_shell(None).is_empty());
        assert!(!resolve_shell(Some("  ")).trim().is_empty());
    }
}
