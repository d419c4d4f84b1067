//! App child hosting
//!
//! [`ProcessHost`] is the seam between the supervisor's restart logic and the
//! operating system. [`PtyHost`] is the real implementation: it spawns the
//! runtime attached to a pseudo-terminal, wires up the per-child IPC socket and
//! reports exits on the supervisor's event channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use portable_pty::{native_pty_system, CommandBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};

use devloop_core::prelude::*;
use devloop_core::{BootstrapScript, ChildLaunchConfig, Message, LAUNCH_ARG};

use crate::process_tree::{self, TreeSignal};
use crate::pty::{current_terminal_size, pump_output, PtyHandle, TerminalSize};

/// Program (plus leading arguments) used to execute bootstrap scripts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for RuntimeCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("node"),
            args: Vec::new(),
        }
    }
}

impl RuntimeCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Everything needed to spawn one app child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    /// Runtime arguments followed by the bootstrap script path
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(runtime: &RuntimeCommand, script: &BootstrapScript, cwd: &Path) -> Self {
        let mut args = runtime.args.clone();
        args.push(script.path().to_string_lossy().into_owned());
        Self {
            program: runtime.program.clone(),
            args,
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Path of the bootstrap script, the last argument
    pub fn script(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }
}

/// Events emitted by app children
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    /// A decoded IPC message from the child with the given pid
    Message { pid: u32, message: Message },
    /// The child exited. `expected` is true when the supervisor asked it to stop.
    Exited {
        pid: u32,
        code: Option<i32>,
        expected: bool,
    },
}

impl ChildEvent {
    pub fn pid(&self) -> u32 {
        match self {
            ChildEvent::Message { pid, .. } | ChildEvent::Exited { pid, .. } => *pid,
        }
    }
}

#[derive(Debug, Default)]
struct ExitState {
    exited: AtomicBool,
    stopping: AtomicBool,
    code: Mutex<Option<i32>>,
    notify: Notify,
}

impl ExitState {
    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        loop {
            // Register before checking so a notification between the two is not lost.
            let notified = self.notify.notified();
            if self.has_exited() {
                return;
            }
            notified.await;
        }
    }
}

/// The supervisor's view of one live app child.
///
/// Exit state is shared with the [`ExitReporter`] held by whatever task waits
/// on the OS process, so `has_exited()` is a lock-free check.
#[derive(Debug)]
pub struct ChildHandle {
    pid: u32,
    started_at: DateTime<Local>,
    pty: Option<PtyHandle>,
    state: Arc<ExitState>,
}

/// Write side of a child's exit state, owned by the task that reaps it
#[derive(Debug)]
pub struct ExitReporter {
    state: Arc<ExitState>,
}

impl ExitReporter {
    /// Record the exit and wake waiters. Returns whether the exit was expected.
    pub fn report(self, code: Option<i32>) -> bool {
        *self
            .state
            .code
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = code;
        self.state.exited.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
        self.state.stopping.load(Ordering::Acquire)
    }
}

/// Read-only future source for "this child has exited"
#[derive(Debug, Clone)]
pub struct ExitWatch {
    state: Arc<ExitState>,
}

impl ExitWatch {
    pub async fn exited(&self) {
        self.state.wait().await
    }
}

impl ChildHandle {
    pub fn new(pid: u32, pty: Option<PtyHandle>) -> (Self, ExitReporter) {
        let state = Arc::new(ExitState::default());
        let handle = Self {
            pid,
            started_at: Local::now(),
            pty,
            state: Arc::clone(&state),
        };
        (handle, ExitReporter { state })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn has_exited(&self) -> bool {
        self.state.has_exited()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self
            .state
            .code
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flag the coming exit as requested by us
    pub fn mark_stopping(&self) {
        self.state.stopping.store(true, Ordering::Release);
    }

    /// Undo [`mark_stopping`](Self::mark_stopping) after a stop that never got delivered
    pub fn clear_stopping(&self) {
        self.state.stopping.store(false, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.state.stopping.load(Ordering::Acquire)
    }

    pub fn exit_watch(&self) -> ExitWatch {
        ExitWatch {
            state: Arc::clone(&self.state),
        }
    }

    /// Wait up to `timeout` for the child to exit. Returns true if it has.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.state.wait()).await.is_ok()
    }

    /// Resize the child's pty. No-op for children without one.
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        match &self.pty {
            Some(pty) => pty.resize(size),
            None => Ok(()),
        }
    }
}

/// Spawns app children and delivers signals to them
#[trait_variant::make(ProcessHost: Send)]
pub trait LocalProcessHost {
    /// Spawn a child. Its IPC messages and exit are reported asynchronously.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ChildHandle>;

    /// Signal `pid` and all of its descendants.
    ///
    /// Returns `Ok(false)` when nothing was alive to receive the signal.
    fn signal_tree(&self, pid: u32, signal: TreeSignal) -> Result<bool>;
}

/// Real host: children attached to a pty, IPC over a per-child Unix socket
pub struct PtyHost {
    event_tx: mpsc::Sender<ChildEvent>,
    ipc_dir: PathBuf,
    generation: AtomicU64,
}

impl PtyHost {
    pub fn new(event_tx: mpsc::Sender<ChildEvent>) -> Self {
        let ipc_dir = std::env::temp_dir().join(format!("devloop-{}", std::process::id()));
        Self::with_ipc_dir(event_tx, ipc_dir)
    }

    pub fn with_ipc_dir(event_tx: mpsc::Sender<ChildEvent>, ipc_dir: PathBuf) -> Self {
        Self {
            event_tx,
            ipc_dir,
            generation: AtomicU64::new(0),
        }
    }

    pub fn ipc_dir(&self) -> &Path {
        &self.ipc_dir
    }

    fn spawn_on_pty(&self, spec: &LaunchSpec, launch: &ChildLaunchConfig) -> Result<ChildHandle> {
        let pair = native_pty_system()
            .openpty(current_terminal_size().into())
            .map_err(|e| Error::spawn(format!("failed to open pty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.arg(LAUNCH_ARG);
        cmd.arg(launch.to_json()?);
        cmd.cwd(&spec.cwd);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            Error::spawn(format!("{}: {}", spec.program.display(), e))
        })?;
        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| Error::spawn("child exited before reporting a pid"))?;

        let pty = PtyHandle::new(pair.master);
        let reader = pty.try_clone_reader()?;
        tokio::task::spawn_blocking(move || pump_output(reader, std::io::stdout()));

        let (handle, reporter) = ChildHandle::new(pid, Some(pty));

        let event_tx = self.event_tx.clone();
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => {
                    debug!("App child {} exited: {:?}", pid, status);
                    Some(status.exit_code() as i32)
                }
                Err(e) => {
                    error!("Error waiting for app child {}: {}", pid, e);
                    None
                }
            };
            let expected = reporter.report(code);
            if event_tx
                .blocking_send(ChildEvent::Exited {
                    pid,
                    code,
                    expected,
                })
                .is_err()
            {
                debug!("Child event channel closed before exit of {}", pid);
            }
        });

        Ok(handle)
    }
}

impl Drop for PtyHost {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.ipc_dir) {
            Ok(()) => debug!("Removed IPC directory {}", self.ipc_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Could not remove IPC directory {}: {}",
                self.ipc_dir.display(),
                e
            ),
        }
    }
}

impl ProcessHost for PtyHost {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ChildHandle> {
        info!(
            "Starting {} {}",
            spec.program.display(),
            spec.args.join(" ")
        );

        #[cfg(unix)]
        let handle = {
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            // Dropping the listener on a failed spawn removes its socket file.
            let listener = crate::ipc_socket::IpcListener::bind(&self.ipc_dir, generation)?;
            let launch = ChildLaunchConfig::dev(Some(listener.path().to_path_buf()));
            let handle = self.spawn_on_pty(spec, &launch)?;
            tokio::spawn(listener.serve(
                handle.pid(),
                self.event_tx.clone(),
                handle.exit_watch(),
            ));
            handle
        };

        // No IPC channel without Unix sockets; the app still runs.
        #[cfg(not(unix))]
        let handle = self.spawn_on_pty(spec, &ChildLaunchConfig::dev(None))?;

        info!("App child started with PID {}", handle.pid());
        Ok(handle)
    }

    fn signal_tree(&self, pid: u32, signal: TreeSignal) -> Result<bool> {
        process_tree::signal_tree(pid, signal)
    }
}
