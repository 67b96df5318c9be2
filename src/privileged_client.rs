use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use nix::unistd::Uid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::privileged::{Helper, HelperOptions};
use crate::privileged_api::{HelperCommand, HelperFrame, HelperRequest};
use crate::tunnel_name::TunnelName;
use crate::wireguard::ToolPaths;

const READ_CHUNK: usize = 8192;
const EXIT_GRACE: Duration = Duration::from_secs(2);
const STDERR_DRAIN: Duration = Duration::from_millis(200);

/// Something that can run helper commands: the spawned broker, or the helper
/// itself when the caller is already privileged.
pub trait HelperClient: Send + Sync {
    fn call(
        &self,
        command: HelperCommand,
        name: Option<&TunnelName>,
        content: &str,
    ) -> impl Future<Output = Result<Value>> + Send;
}

impl HelperClient for Helper {
    fn call(
        &self,
        command: HelperCommand,
        name: Option<&TunnelName>,
        content: &str,
    ) -> impl Future<Output = Result<Value>> + Send {
        self.execute(command, name, content)
    }
}

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Pipes of a freshly started helper.
pub struct SpawnedHelper {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub child: Option<Child>,
}

pub trait HelperSpawner: Send + Sync + 'static {
    fn spawn(&self) -> Result<SpawnedHelper>;
}

/// Launches `<tool> <helper exe> helper ...` with a scrubbed environment.
#[derive(Debug, Clone)]
pub struct PrivilegeToolSpawner {
    tool: String,
    helper_exe: PathBuf,
    config_dir: PathBuf,
    tools: ToolPaths,
    passthrough_env: Vec<String>,
}

impl PrivilegeToolSpawner {
    #[must_use]
    pub fn new(tool: impl Into<String>, helper_exe: PathBuf, options: &HelperOptions) -> Self {
        Self {
            tool: tool.into(),
            helper_exe,
            config_dir: options.config_dir.clone(),
            tools: options.tools.clone(),
            passthrough_env: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_passthrough_env(mut self, keys: Vec<String>) -> Self {
        self.passthrough_env = keys;
        self
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let helper_exe = match config.privileged.helper_path.trim() {
            "" => std::env::current_exe().map_err(|e| {
                AppError::PrivilegeToolMissing(format!("cannot resolve current executable: {}", e))
            })?,
            path => PathBuf::from(path),
        };
        Ok(Self::new(
            config.privileged.tool.trim(),
            helper_exe,
            &config.helper_options(),
        )
        .with_passthrough_env(config.privileged.passthrough_env.clone()))
    }

    /// Resolve the privilege tool and helper executable on disk.
    fn resolve(&self) -> Result<(Option<PathBuf>, PathBuf)> {
        let tool = if self.tool.is_empty() {
            None
        } else {
            let path = which::which(&self.tool).map_err(|_| {
                AppError::PrivilegeToolMissing(format!("{} not found in PATH", self.tool))
            })?;
            Some(path)
        };
        if !self.helper_exe.is_file() {
            return Err(AppError::PrivilegeToolMissing(format!(
                "helper executable {} not found",
                self.helper_exe.display()
            )));
        }
        Ok((tool, self.helper_exe.clone()))
    }
}

impl HelperSpawner for PrivilegeToolSpawner {
    fn spawn(&self) -> Result<SpawnedHelper> {
        let (tool, helper_exe) = self.resolve()?;

        let mut command = match &tool {
            Some(tool) => {
                let mut command = Command::new(tool);
                command.arg(&helper_exe);
                command
            }
            None => Command::new(&helper_exe),
        };
        command
            .arg("helper")
            .arg("--config-dir")
            .arg(&self.config_dir)
            .arg("--wg-bin")
            .arg(&self.tools.wg)
            .arg("--wg-quick-bin")
            .arg(&self.tools.wg_quick)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &self.passthrough_env {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        debug!(
            tool = ?tool.as_ref().map(|t| t.display().to_string()),
            helper = ?helper_exe.display().to_string(), "privileged_helper_spawn_begin");
        let mut child = command
            .spawn()
            .map_err(|e| map_spawn_error(e, tool.as_ref().unwrap_or(&helper_exe)))?;
        debug!( pid = ?child.id(), "privileged_helper_spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Protocol("failed to capture helper stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Protocol("failed to capture helper stdout".into()))?;
        let stderr = child.stderr.take();

        Ok(SpawnedHelper {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            child: Some(child),
        })
    }
}

fn map_spawn_error(e: std::io::Error, program: &std::path::Path) -> AppError {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            AppError::PrivilegeToolMissing(format!("{} not found", program.display()))
        }
        std::io::ErrorKind::PermissionDenied => {
            AppError::AuthorizationFailed(format!("{} is not executable", program.display()))
        }
        _ => AppError::Io(e),
    }
}

/// Splits a byte stream into `\n`-terminated lines, holding back a trailing
/// partial line until the rest arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
    // Prefix of `partial` already known to hold no newline.
    scanned: usize,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);
        let mut lines = Vec::new();
        let mut start = self.scanned;
        while let Some(offset) = self.partial[start..].iter().position(|b| *b == b'\n') {
            let pos = start + offset;
            start = 0;
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        self.scanned = self.partial.len();
        lines
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.partial.len()
    }
}

#[derive(Default)]
struct PendingState {
    closed: bool,
    entries: HashMap<u64, oneshot::Sender<Result<Value>>>,
}

#[derive(Default)]
struct PendingTable {
    state: Mutex<PendingState>,
}

impl PendingTable {
    fn register(&self, id: u64) -> Result<oneshot::Receiver<Result<Value>>> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(AppError::HelperTerminated);
        }
        let (tx, rx) = oneshot::channel();
        state.entries.insert(id, tx);
        Ok(rx)
    }

    fn resolve(&self, id: u64, result: Result<Value>) -> bool {
        let sender = lock(&self.state).entries.remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Close the table and reject everything still waiting.
    fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = lock(&self.state);
            state.closed = true;
            state.entries.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(AppError::HelperTerminated));
        }
        count
    }

    fn forget(&self, id: u64) {
        lock(&self.state).entries.remove(&id);
    }

    fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }
}

/// Drops a pending entry whose caller went away before the reply arrived.
struct PendingEntry<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.forget(self.id);
    }
}

struct Session {
    generation: u64,
    pid: Option<u32>,
    // Whole encoded frames for the stdin writer task.
    frames: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<PendingTable>,
    // Dropping the session lets the child watcher reap the process.
    _release: Option<oneshot::Sender<()>>,
}

type StartupFuture = Shared<BoxFuture<'static, std::result::Result<Arc<Session>, Arc<AppError>>>>;

enum Slot {
    Empty,
    Starting {
        generation: u64,
        future: StartupFuture,
    },
    Ready(Arc<Session>),
}

struct BrokerInner {
    spawner: Box<dyn HelperSpawner>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    slot: Mutex<Slot>,
}

impl BrokerInner {
    fn reset_slot(&self, generation: u64) {
        let mut slot = lock(&self.slot);
        let matches = match &*slot {
            Slot::Starting { generation: g, .. } => *g == generation,
            Slot::Ready(session) => session.generation == generation,
            Slot::Empty => false,
        };
        if matches {
            *slot = Slot::Empty;
        }
    }
}

/// Owns at most one helper session and multiplexes concurrent calls over it.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(spawner: impl HelperSpawner) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                spawner: Box::new(spawner),
                next_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                slot: Mutex::new(Slot::Empty),
            }),
        }
    }

    /// Send one command, starting the helper first if needed.
    pub async fn call(
        &self,
        command: HelperCommand,
        name: Option<&TunnelName>,
        content: &str,
    ) -> Result<Value> {
        let session = self.session().await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut frame = serde_json::to_vec(&HelperRequest::new(id, command, name, content))?;
        frame.push(b'\n');

        let reply = session.pending.register(id)?;
        let _entry = PendingEntry {
            pending: &session.pending,
            id,
        };
        tracing::trace!( id = ?id, command = ?command.as_str(), "privileged_request_queued");
        if session.frames.send(frame).is_err() {
            teardown(
                &Arc::downgrade(&self.inner),
                &session.pending,
                session.generation,
                "stdin writer gone",
            );
        }

        match reply.await {
            Ok(result) => result,
            Err(_) => Err(AppError::HelperTerminated),
        }
    }

    /// Number of calls queued for the helper and still awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        match &*lock(&self.inner.slot) {
            Slot::Ready(session) => session.pending.len(),
            _ => 0,
        }
    }

    /// Drop the current session. Outstanding calls fail with `HelperTerminated`.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.slot), Slot::Empty);
        match previous {
            Slot::Ready(session) => {
                let rejected = session.pending.close();
                info!(
                    pid = ?session.pid,
                    rejected = ?rejected, "privileged_helper_shutdown");
            }
            Slot::Starting { generation, .. } => {
                info!( generation = ?generation, "privileged_helper_shutdown_during_startup");
            }
            Slot::Empty => {}
        }
    }

    async fn session(&self) -> Result<Arc<Session>> {
        let (generation, future) = {
            let mut slot = lock(&self.inner.slot);
            match &*slot {
                Slot::Ready(session) => return Ok(session.clone()),
                Slot::Starting { generation, future } => (*generation, future.clone()),
                Slot::Empty => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
                    let future = start_session(Arc::downgrade(&self.inner), generation)
                        .boxed()
                        .shared();
                    *slot = Slot::Starting {
                        generation,
                        future: future.clone(),
                    };
                    (generation, future)
                }
            }
        };

        match future.await {
            Ok(session) => {
                let mut slot = lock(&self.inner.slot);
                let current = match &*slot {
                    Slot::Starting { generation: g, .. } => *g == generation,
                    Slot::Ready(ready) => ready.generation == generation,
                    Slot::Empty => false,
                };
                if !current {
                    // Shut down or torn down while starting.
                    drop(slot);
                    session.pending.close();
                    return Err(AppError::HelperTerminated);
                }
                if matches!(&*slot, Slot::Starting { .. }) {
                    *slot = Slot::Ready(session.clone());
                }
                Ok(session)
            }
            Err(e) => {
                self.inner.reset_slot(generation);
                Err(reissue(&e))
            }
        }
    }
}

impl HelperClient for Broker {
    fn call(
        &self,
        command: HelperCommand,
        name: Option<&TunnelName>,
        content: &str,
    ) -> impl Future<Output = Result<Value>> + Send {
        Broker::call(self, command, name, content)
    }
}

async fn start_session(
    inner: Weak<BrokerInner>,
    generation: u64,
) -> std::result::Result<Arc<Session>, Arc<AppError>> {
    let spawned = match inner.upgrade() {
        Some(inner) => inner.spawner.spawn().map_err(Arc::new)?,
        None => return Err(Arc::new(AppError::HelperTerminated)),
    };
    let SpawnedHelper {
        stdin,
        stdout,
        stderr,
        child,
    } = spawned;

    let pid = child.as_ref().and_then(Child::id);
    let pending = Arc::new(PendingTable::default());
    let (release_tx, release_rx) = oneshot::channel();
    let release = child.map(|child| {
        tokio::spawn(watch_child(
            inner.clone(),
            pending.clone(),
            generation,
            child,
            release_rx,
        ));
        release_tx
    });

    let last_stderr = Arc::new(Mutex::new(None::<String>));
    let mut stderr_closed = stderr.map(|stderr| {
        let (closed_tx, closed_rx) = oneshot::channel::<()>();
        tokio::spawn(forward_stderr(stderr, last_stderr.clone(), closed_tx));
        closed_rx
    });

    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(read_frames(
        inner.clone(),
        pending.clone(),
        generation,
        stdout,
        ready_tx,
    ));

    let (frames, frames_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_frames(
        inner.clone(),
        pending.clone(),
        generation,
        stdin,
        frames_rx,
    ));

    let session = Arc::new(Session {
        generation,
        pid,
        frames,
        pending,
        _release: release,
    });

    let ready = tokio::select! {
        biased;
        ready = ready_rx => ready.is_ok(),
        _ = stderr_eof(stderr_closed.as_mut()) => false,
    };
    if ready {
        info!( pid = ?pid, generation = ?generation, "privileged_helper_ready");
        return Ok(session);
    }

    // Let the stderr forwarder catch the tool's final complaint.
    let _ = tokio::time::timeout(STDERR_DRAIN, stderr_eof(stderr_closed.as_mut())).await;
    session.pending.close();
    let reason = lock(&last_stderr)
        .clone()
        .unwrap_or_else(|| "helper exited before it was ready".into());
    warn!( pid = ?pid, reason = ?reason, "privileged_helper_authorization_failed");
    Err(Arc::new(AppError::AuthorizationFailed(reason)))
}

async fn stderr_eof(closed: Option<&mut oneshot::Receiver<()>>) {
    match closed {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Sole owner of the helper's stdin. Frames are written whole even when the
/// caller that queued one has gone. Ends once every session handle drops,
/// which closes stdin.
async fn write_frames(
    inner: Weak<BrokerInner>,
    pending: Arc<PendingTable>,
    generation: u64,
    mut stdin: BoxedWriter,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut stdin, &frame).await {
            warn!( error = ?e.to_string(), "privileged_request_write_failed");
            teardown(&inner, &pending, generation, "stdin write failed");
            return;
        }
    }
}

async fn write_frame(stdin: &mut BoxedWriter, frame: &[u8]) -> std::io::Result<()> {
    stdin.write_all(frame).await?;
    stdin.flush().await
}

async fn read_frames(
    inner: Weak<BrokerInner>,
    pending: Arc<PendingTable>,
    generation: u64,
    mut stdout: BoxedReader,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut buffer = LineBuffer::default();
    let mut chunk = vec![0u8; READ_CHUNK];

    let reason = loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break "stdout closed".to_string(),
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    dispatch_frame(&line, &pending, &mut ready_tx);
                }
            }
            Err(e) => break format!("stdout read failed: {}", e),
        }
    };
    teardown(&inner, &pending, generation, &reason);
}

fn dispatch_frame(
    line: &str,
    pending: &PendingTable,
    ready_tx: &mut Option<oneshot::Sender<()>>,
) {
    match HelperFrame::parse(line) {
        Some(HelperFrame::Ready) => {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
        }
        Some(HelperFrame::Reply(reply)) => {
            let id = reply.id;
            if !pending.resolve(id, reply.into_result()) {
                debug!( id = ?id, "privileged_reply_unknown_id");
            }
        }
        None => debug!( line = ?line, "privileged_frame_ignored"),
    }
}

async fn forward_stderr(
    stderr: BoxedReader,
    last_line: Arc<Mutex<Option<String>>>,
    closed: oneshot::Sender<()>,
) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if text.is_empty() {
                    continue;
                }
                debug!( line = ?text, "privileged_helper_stderr");
                *lock(&last_line) = Some(text);
            }
        }
    }
    let _ = closed.send(());
}

async fn watch_child(
    inner: Weak<BrokerInner>,
    pending: Arc<PendingTable>,
    generation: u64,
    mut child: Child,
    released: oneshot::Receiver<()>,
) {
    let pid = child.id();
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = released => None,
    };

    match exited {
        Some(status) => {
            match status {
                Ok(status) => debug!(
                    pid = ?pid,
                    status = ?status.to_string(), "privileged_helper_exited"),
                Err(e) => debug!(
                    pid = ?pid,
                    error = ?e.to_string(), "privileged_helper_wait_failed"),
            }
            teardown(&inner, &pending, generation, "helper exited");
        }
        None => {
            debug!( pid = ?pid, "privileged_helper_released");
            if tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_err() {
                debug!( pid = ?pid, "privileged_helper_still_running_after_grace");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

fn teardown(inner: &Weak<BrokerInner>, pending: &PendingTable, generation: u64, reason: &str) {
    let rejected = pending.close();
    if rejected > 0 {
        warn!(
            generation = ?generation,
            rejected = ?rejected,
            reason = ?reason, "privileged_session_torn_down");
    } else {
        debug!(
            generation = ?generation,
            reason = ?reason, "privileged_session_closed");
    }
    if let Some(inner) = inner.upgrade() {
        inner.reset_slot(generation);
    }
}

/// Startup errors are shared by every waiter; hand each its own copy.
fn reissue(e: &AppError) -> AppError {
    match e {
        AppError::PrivilegeToolMissing(m) => AppError::PrivilegeToolMissing(m.clone()),
        AppError::AuthorizationFailed(m) => AppError::AuthorizationFailed(m.clone()),
        AppError::HelperTerminated => AppError::HelperTerminated,
        AppError::Protocol(m) => AppError::Protocol(m.clone()),
        other => AppError::Helper(other.to_string()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The helper transport chosen for this process.
#[derive(Clone)]
pub enum Backend {
    Spawned(Broker),
    InProcess(Arc<Helper>),
}

impl Backend {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        if config.privileged.in_process_when_root && Uid::effective().is_root() {
            debug!("privileged_backend_in_process");
            return Ok(Self::InProcess(Arc::new(Helper::new(config.helper_options()))));
        }
        let spawner = PrivilegeToolSpawner::from_config(config)?;
        Ok(Self::Spawned(Broker::new(spawner)))
    }

    pub fn shutdown(&self) {
        if let Self::Spawned(broker) = self {
            broker.shutdown();
        }
    }
}

impl HelperClient for Backend {
    fn call(
        &self,
        command: HelperCommand,
        name: Option<&TunnelName>,
        content: &str,
    ) -> impl Future<Output = Result<Value>> + Send {
        async move {
            match self {
                Self::Spawned(broker) => broker.call(command, name, content).await,
                Self::InProcess(helper) => helper.execute(command, name, content).await,
            }
        }
    }
}
