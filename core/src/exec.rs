#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use serde_json::json;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::TASKS_CONTEXT_KEY;
use crate::config::ConfigSource;
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::output::ContextPublisher;
use crate::output::OutputSink;
use crate::process_tree::KillSignal;
use crate::process_tree::ProcessTreeKiller;

// I/O buffer sizing
const READ_CHUNK_SIZE: usize = 8192; // bytes per read
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Identity of something being run: the file the command was expanded for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunTarget(PathBuf);

impl RunTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for RunTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<PathBuf> for RunTarget {
    fn from(value: PathBuf) -> Self {
        Self(value)
    }
}

impl From<&Path> for RunTarget {
    fn from(value: &Path) -> Self {
        Self(value.to_path_buf())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDispatch {
    Spawned { pid: Option<u32> },
    /// The target already has a live process; nothing was started.
    AlreadyRunning,
    /// The process could not be started. The reason was logged and written
    /// to the output sink.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    ExitedWithCode(i32),
    KilledBySignal(i32),
    KilledByUnknownMeans,
}

impl TaskOutcome {
    pub fn from_exit_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return TaskOutcome::ExitedWithCode(code);
        }
        #[cfg(unix)]
        if let Some(signal) = status.signal() {
            return TaskOutcome::KilledBySignal(signal);
        }
        TaskOutcome::KilledByUnknownMeans
    }

    pub fn is_success(self) -> bool {
        self == TaskOutcome::ExitedWithCode(0)
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::ExitedWithCode(code) => {
                write!(f, "Child process exited with code: {code}")
            }
            TaskOutcome::KilledBySignal(signal) => write!(
                f,
                "Child process was killed by signal: {}",
                signal_name(*signal)
            ),
            TaskOutcome::KilledByUnknownMeans => {
                write!(f, "Child process was killed by unknown means.")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Started {
        target: RunTarget,
        pid: Option<u32>,
    },
    Output {
        target: RunTarget,
        chunk: String,
    },
    Finished {
        target: RunTarget,
        outcome: TaskOutcome,
        elapsed: Duration,
    },
}

#[derive(Debug)]
struct Task {
    pid: Option<u32>,
    cancel: CancellationToken,
}

/// Runs expanded commands as shell subprocesses, at most one per target.
///
/// The engine is a cheap handle; clones share the same task registry. The
/// registry lives from construction until the last handle is dropped; call
/// [`ExecEngine::shutdown`] first to kill whatever is still running.
#[derive(Clone)]
pub struct ExecEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    tasks: StdMutex<HashMap<RunTarget, Task>>,
    /// Bumped on every registry mutation, while `tasks` is held.
    generation: AtomicU64,
    /// Generation of the last task list handed to the publisher.
    published_generation: StdMutex<u64>,
    config: Arc<dyn ConfigSource>,
    sink: Arc<dyn OutputSink>,
    publisher: Arc<dyn ContextPublisher>,
    killer: Arc<dyn ProcessTreeKiller>,
    events: broadcast::Sender<EngineEvent>,
}

impl ExecEngine {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        sink: Arc<dyn OutputSink>,
        publisher: Arc<dyn ContextPublisher>,
        killer: Arc<dyn ProcessTreeKiller>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                tasks: StdMutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                published_generation: StdMutex::new(0),
                config,
                sink,
                publisher,
                killer,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self, target: &RunTarget) -> bool {
        self.inner.lock_tasks().contains_key(target)
    }

    pub fn running_targets(&self) -> Vec<RunTarget> {
        self.inner.running_targets()
    }

    /// Spawns `command` through the platform shell and returns without
    /// waiting for it. Output and the final status line go to the sink.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run(&self, target: RunTarget, command: &str) -> RunDispatch {
        let config = self.inner.config.load();

        // Check, spawn and register under one lock so a re-entrant request
        // for the same target can never start a second process.
        let (child, pid, cancel, started_at, snapshot) = {
            let mut tasks = self.inner.lock_tasks();
            if tasks.contains_key(&target) {
                tracing::debug!(%target, "already running; ignoring run request");
                return RunDispatch::AlreadyRunning;
            }

            let cwd = config.workspace_folder_for(target.path());
            let child = match spawn_shell(command, cwd) {
                Ok(child) => child,
                Err(err) => {
                    drop(tasks);
                    tracing::error!(%target, "{err}");
                    self.inner.announce(&config, &format!("[error] {err}"));
                    return RunDispatch::Failed;
                }
            };
            let pid = child.id();
            let cancel = CancellationToken::new();
            tasks.insert(
                target.clone(),
                Task {
                    pid,
                    cancel: cancel.clone(),
                },
            );
            let snapshot = self.inner.snapshot(&tasks);
            (child, pid, cancel, Instant::now(), snapshot)
        };

        tracing::info!(%target, ?pid, command, "spawned child process");
        if config.show_output_before_run {
            self.inner.sink.show(true);
        }
        if config.clear_output_before_run {
            self.inner.sink.clear();
        }
        self.inner
            .announce(&config, &format!("[info] Running {target}"));
        self.inner.publish_tasks(snapshot);
        let _ = self.inner.events.send(EngineEvent::Started {
            target: target.clone(),
            pid,
        });

        tokio::spawn(supervise(
            Arc::clone(&self.inner),
            target,
            child,
            pid,
            cancel,
            started_at,
        ));
        RunDispatch::Spawned { pid }
    }

    /// Requests termination of the process tree running `target`. The task
    /// stays registered until the process is actually gone. Returns whether
    /// `target` was running.
    pub fn cancel(&self, target: &RunTarget) -> bool {
        match self.inner.lock_tasks().get(target) {
            Some(task) => {
                tracing::info!(%target, pid = ?task.pid, "cancellation requested");
                task.cancel.cancel();
                true
            }
            None => {
                tracing::debug!(%target, "cancel ignored; target is not running");
                false
            }
        }
    }

    /// Cancels every in-flight task.
    pub fn shutdown(&self) {
        for task in self.inner.lock_tasks().values() {
            task.cancel.cancel();
        }
    }
}

impl EngineInner {
    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<RunTarget, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running_targets(&self) -> Vec<RunTarget> {
        sorted_targets(&self.lock_tasks())
    }

    /// Captures the registry right after a mutation. `tasks` must be the
    /// guard the mutation was made under.
    fn snapshot(&self, tasks: &HashMap<RunTarget, Task>) -> TasksSnapshot {
        TasksSnapshot {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            targets: sorted_targets(tasks),
        }
    }

    /// Hands `snapshot` to the publisher unless a newer one already went out.
    fn publish_tasks(&self, snapshot: TasksSnapshot) {
        let mut published = self
            .published_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if snapshot.generation <= *published {
            tracing::trace!(
                generation = snapshot.generation,
                latest = *published,
                "dropping stale task list"
            );
            return;
        }
        *published = snapshot.generation;
        let keys: Vec<String> = snapshot.targets.iter().map(ToString::to_string).collect();
        self.publisher.publish(TASKS_CONTEXT_KEY, json!(keys));
    }

    fn announce(&self, config: &RunnerConfig, message: &str) {
        self.sink
            .append(&format!("{}{message}\n", timestamp_prefix(config)));
    }

    fn kill(&self, target: &RunTarget, pid: Option<u32>, child: &mut Child) {
        let Some(pid) = pid else {
            let _ = child.start_kill();
            return;
        };
        if let Err(err) = self.killer.kill_tree(pid, KillSignal::Kill) {
            tracing::warn!(%target, pid, error = %err, "failed to kill process tree; killing child only");
            if let Err(err) = child.start_kill() {
                tracing::warn!(%target, pid, error = %err, "failed to kill child process");
            }
        }
    }
}

struct TasksSnapshot {
    generation: u64,
    targets: Vec<RunTarget>,
}

fn sorted_targets(tasks: &HashMap<RunTarget, Task>) -> Vec<RunTarget> {
    let mut targets: Vec<RunTarget> = tasks.keys().cloned().collect();
    targets.sort();
    targets
}

fn spawn_shell(command: &str, cwd: Option<&Path>) -> Result<Child, RunnerError> {
    let mut cmd = shell_command(command);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Own process group, so the whole tree can be signalled at once.
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn().map_err(|source| RunnerError::Spawn {
        command: command.to_string(),
        source,
    })
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").raw_arg(command);
    cmd
}

async fn supervise(
    inner: Arc<EngineInner>,
    target: RunTarget,
    mut child: Child,
    pid: Option<u32>,
    cancel: CancellationToken,
    started_at: Instant,
) {
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_chunks(stdout, chunk_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_chunks(stderr, chunk_tx.clone()));
    }
    drop(chunk_tx);

    let mut forwarder = ChunkForwarder::new(&inner, &target);
    let mut kill_sent = false;
    let mut exit: Option<std::io::Result<ExitStatus>> = None;
    let mut streams_open = true;

    // Output keeps flowing while waiting; after exit, drain until both pipes
    // close so the status line is always the last thing appended.
    while exit.is_none() || streams_open {
        tokio::select! {
            status = child.wait(), if exit.is_none() => {
                exit = Some(status);
            }
            chunk = chunk_rx.recv(), if streams_open => match chunk {
                Some(chunk) => forwarder.forward(chunk),
                None => streams_open = false,
            },
            _ = cancel.cancelled(), if !kill_sent => {
                kill_sent = true;
                inner.kill(&target, pid, &mut child);
            }
        }
    }

    let outcome = match exit {
        Some(Ok(status)) => TaskOutcome::from_exit_status(status),
        Some(Err(err)) => {
            tracing::error!(%target, error = %err, "failed to wait for child process");
            TaskOutcome::KilledByUnknownMeans
        }
        None => TaskOutcome::KilledByUnknownMeans,
    };
    let elapsed = started_at.elapsed();

    let snapshot = {
        let mut tasks = inner.lock_tasks();
        tasks.remove(&target);
        inner.snapshot(&tasks)
    };
    inner.publish_tasks(snapshot);

    let config = inner.config.load();
    let separator = if forwarder.at_line_start { "" } else { "\n" };
    inner.sink.append(&format!(
        "{separator}{}[info] {outcome} (elapsed {})\n",
        timestamp_prefix(&config),
        format_elapsed(elapsed)
    ));
    tracing::info!(%target, %outcome, ?elapsed, "child process finished");
    let _ = inner.events.send(EngineEvent::Finished {
        target,
        outcome,
        elapsed,
    });
}

struct ChunkForwarder<'a> {
    inner: &'a EngineInner,
    target: &'a RunTarget,
    at_line_start: bool,
}

impl<'a> ChunkForwarder<'a> {
    fn new(inner: &'a EngineInner, target: &'a RunTarget) -> Self {
        Self {
            inner,
            target,
            at_line_start: true,
        }
    }

    fn forward(&mut self, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        self.at_line_start = chunk.ends_with('\n');
        self.inner.sink.append(&chunk);
        let _ = self.inner.events.send(EngineEvent::Output {
            target: self.target.clone(),
            chunk,
        });
    }
}

async fn read_chunks<R: AsyncRead + Unpin + Send + 'static>(
    mut reader: R,
    tx: mpsc::UnboundedSender<String>,
) {
    let mut tmp = [0u8; READ_CHUNK_SIZE];
    let mut decoder = Utf8Chunker::default();
    loop {
        let n = match reader.read(&mut tmp).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read child output");
                break;
            }
        };
        let text = decoder.push(&tmp[..n]);
        if !text.is_empty() && tx.send(text).is_err() {
            return;
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = tx.send(rest);
    }
}

/// Turns raw reads into text without splitting multi-byte characters that
/// straddle two reads. Invalid sequences become U+FFFD.
#[derive(Default)]
pub(crate) struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = incomplete_suffix_len(&self.pending);
        let ready = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..ready]).into_owned();
        self.pending.drain(..ready);
        text
    }

    pub(crate) fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, possibly valid but incomplete, UTF-8 sequence.
fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => 0,
        Err(err) if err.error_len().is_none() => bytes.len() - err.valid_up_to(),
        Err(_) => {
            // An invalid sequence somewhere; only hold back a trailing
            // lead byte run of at most three bytes.
            let tail_start = bytes.len().saturating_sub(3);
            (tail_start..bytes.len())
                .find(|&i| {
                    let lead = bytes[i];
                    let width = match lead {
                        0xC0..=0xDF => 2,
                        0xE0..=0xEF => 3,
                        0xF0..=0xF7 => 4,
                        _ => return false,
                    };
                    bytes.len() - i < width
                })
                .map_or(0, |i| bytes.len() - i)
        }
    }
}

fn timestamp_prefix(config: &RunnerConfig) -> String {
    if config.show_debug_timestamps {
        format!("{} ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    } else {
        String::new()
    }
}

pub(crate) fn format_elapsed(duration: Duration) -> String {
    if duration < Duration::from_secs(1) {
        return format!("{}ms", duration.as_millis());
    }
    if duration < Duration::from_secs(60) {
        return format!("{:.2}s", duration.as_secs_f64());
    }
    let minutes = duration.as_secs() / 60;
    let seconds = duration.as_secs() % 60;
    format!("{minutes}m{seconds:02}s")
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        _ => return format!("signal {signal}"),
    };
    name.to_string()
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    format!("signal {signal}")
}
