//! Process supervisor for the long-running app child
//!
//! Owns zero or one app child. Restarts are kill-before-spawn: the previous
//! child and its descendants are terminated (SIGTERM, grace period, SIGKILL)
//! and only then is the next one spawned. Restart requests go through a
//! [`Coalescer`], so a burst of file changes produces at most one trailing
//! restart.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};

use devloop_core::prelude::*;
use devloop_core::BootstrapScript;

use crate::coalesce::{Coalesced, Coalescer};
use crate::host::{ChildHandle, LaunchSpec, ProcessHost, RuntimeCommand};
use crate::process_tree::TreeSignal;
use crate::pty::TerminalSize;

/// Default time a child gets to exit after SIGTERM
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for the OS to reap a child after SIGKILL
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub runtime: RuntimeCommand,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub kill_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(runtime: RuntimeCommand, cwd: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            cwd: cwd.into(),
            env: Vec::new(),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    fn launch_spec(&self, script: &BootstrapScript) -> LaunchSpec {
        LaunchSpec::new(&self.runtime, script, &self.cwd).with_env(self.env.clone())
    }
}

/// Result of [`Supervisor::stop`], shared by every caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// There was no child to stop
    NotRunning,
    Stopped { pid: u32, code: Option<i32> },
    /// The child survived SIGKILL within the reap timeout
    Unresponsive { pid: u32 },
}

enum Termination {
    Exited(Option<i32>),
    Unresponsive,
}

struct Inner<H> {
    host: H,
    config: SupervisorConfig,
    slot: Mutex<Option<ChildHandle>>,
    stopped: AtomicBool,
    start_or_restart_pending: AtomicBool,
    stop_outcome: OnceCell<StopOutcome>,
    current_pid: AtomicU32,
}

/// Supervises the app child. Cheap to clone; clones share the child slot.
pub struct Supervisor<H> {
    inner: Arc<Inner<H>>,
    restarts: Coalescer<BootstrapScript, Result<Option<u32>>>,
}

impl<H> Clone for Supervisor<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            restarts: self.restarts.clone(),
        }
    }
}

impl<H> Supervisor<H>
where
    H: ProcessHost + Sync + 'static,
{
    pub fn new(host: H, config: SupervisorConfig) -> Self {
        let inner = Arc::new(Inner {
            host,
            config,
            slot: Mutex::new(None),
            stopped: AtomicBool::new(false),
            start_or_restart_pending: AtomicBool::new(false),
            stop_outcome: OnceCell::new(),
            current_pid: AtomicU32::new(0),
        });

        let restart_inner = Arc::clone(&inner);
        let restarts = Coalescer::new(move |script: BootstrapScript| {
            let inner = Arc::clone(&restart_inner);
            async move { inner.restart(script).await }
        });

        Self { inner, restarts }
    }

    /// Start the app, or replace the running one, with `script`.
    ///
    /// Returns `Coalesced::Executing` when a restart is already in flight; the
    /// script is then used by the single trailing restart. The driving caller
    /// gets the pid of the child that ended up running, or `None` when the
    /// spawn was skipped because the supervisor is stopping.
    pub async fn start_or_restart(
        &self,
        script: BootstrapScript,
    ) -> Result<Coalesced<Option<u32>>> {
        match self.restarts.call(script).await {
            Coalesced::Executing => Ok(Coalesced::Executing),
            Coalesced::Result(result) => result.map(Coalesced::Result),
        }
    }

    /// Stop the child for good. Idempotent: every call gets the same outcome.
    pub async fn stop(&self) -> Result<StopOutcome> {
        // Set before anything awaits so an in-flight restart skips its spawn.
        self.inner.stopped.store(true, Ordering::Release);

        let outcome = self
            .inner
            .stop_outcome
            .get_or_try_init(|| self.inner.stop_once())
            .await?;
        Ok(*outcome)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn is_restarting(&self) -> bool {
        self.restarts.is_running()
    }

    /// Pid of the most recently spawned child that has not been torn down
    pub fn current_pid(&self) -> Option<u32> {
        match self.inner.current_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Forward a terminal size change to the live child.
    ///
    /// Skipped while a restart holds the slot; the next child picks up the
    /// current size when it is spawned.
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        let Ok(slot) = self.inner.slot.try_lock() else {
            trace!("Child slot busy, skipping resize");
            return Ok(());
        };
        match slot.as_ref() {
            Some(child) if !child.has_exited() => child.resize(size),
            _ => Ok(()),
        }
    }
}

impl<H> Inner<H>
where
    H: ProcessHost + Sync + 'static,
{
    async fn restart(&self, script: BootstrapScript) -> Result<Option<u32>> {
        if self.stopped.load(Ordering::Acquire) {
            debug!("Supervisor stopped, ignoring start request");
            return Ok(None);
        }

        if self.start_or_restart_pending.swap(true, Ordering::AcqRel) {
            warn!("start_or_restart already in progress, refusing re-entrant spawn");
            return Ok(None);
        }
        let _pending = PendingGuard(&self.start_or_restart_pending);

        let mut slot = self.slot.lock().await;

        // The previous child stays in the slot until it is known to be gone,
        // so a failed signal leaves it reachable by the next restart or stop.
        if let Some(previous) = slot.as_ref() {
            let pid = previous.pid();
            match self.terminate(previous).await? {
                Termination::Exited(code) => {
                    info!("Previous app child {} exited ({:?})", pid, code);
                    *slot = None;
                    self.current_pid.store(0, Ordering::Release);
                }
                Termination::Unresponsive => {
                    return Err(Error::process(format!(
                        "app child {} did not exit after SIGKILL, not starting a new one",
                        pid
                    )));
                }
            }
        }

        if self.stopped.load(Ordering::Acquire) {
            info!("Stop requested during restart, not spawning");
            return Ok(None);
        }

        let spec = self.config.launch_spec(&script);
        let child = self.host.spawn(&spec).await?;
        let pid = child.pid();
        self.current_pid.store(pid, Ordering::Release);
        *slot = Some(child);

        Ok(Some(pid))
    }

    async fn stop_once(&self) -> Result<StopOutcome> {
        let mut slot = self.slot.lock().await;

        let Some(child) = slot.as_ref() else {
            return Ok(StopOutcome::NotRunning);
        };
        let pid = child.pid();

        // On error the child stays in the slot and the stop can be retried.
        match self.terminate(child).await? {
            Termination::Exited(code) => {
                info!("App child {} stopped", pid);
                *slot = None;
                self.current_pid.store(0, Ordering::Release);
                Ok(StopOutcome::Stopped { pid, code })
            }
            Termination::Unresponsive => {
                error!("App child {} is unresponsive to SIGKILL", pid);
                Ok(StopOutcome::Unresponsive { pid })
            }
        }
    }

    async fn terminate(&self, child: &ChildHandle) -> Result<Termination> {
        let pid = child.pid();
        if child.has_exited() {
            return Ok(Termination::Exited(child.exit_code()));
        }

        child.mark_stopping();
        debug!("Terminating app child {}", pid);
        self.signal(child, TreeSignal::Terminate)?;

        if child.wait_for_exit(self.config.kill_grace).await {
            return Ok(Termination::Exited(child.exit_code()));
        }

        warn!(
            "App child {} did not exit within {:?}, sending SIGKILL",
            pid, self.config.kill_grace
        );
        self.signal(child, TreeSignal::Kill)?;

        if child.wait_for_exit(KILL_REAP_TIMEOUT).await {
            Ok(Termination::Exited(child.exit_code()))
        } else {
            Ok(Termination::Unresponsive)
        }
    }

    fn signal(&self, child: &ChildHandle, signal: TreeSignal) -> Result<()> {
        match self.host.signal_tree(child.pid(), signal) {
            Ok(_) => Ok(()),
            Err(e) => {
                // A later exit of this child is no longer one we asked for.
                if !child.has_exited() {
                    child.clear_stopping();
                }
                Err(e)
            }
        }
    }
}

struct PendingGuard<'a>(&'a AtomicBool);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeHost, HostCall};

    fn script(name: &str) -> BootstrapScript {
        BootstrapScript::new(format!("/proj/.devloop/{}.mjs", name))
    }

    fn supervisor(host: FakeHost) -> Supervisor<FakeHost> {
        Supervisor::new(
            host,
            SupervisorConfig::new(RuntimeCommand::new("node"), "/proj")
                .with_kill_grace(Duration::from_millis(500)),
        )
    }

    #[tokio::test]
    async fn test_first_start_spawns_child() {
        let host = FakeHost::new();
        let sup = supervisor(host.clone());

        let pid = sup.start_or_restart(script("a")).await.unwrap();

        assert_eq!(pid, Coalesced::Result(Some(1000)));
        assert_eq!(sup.current_pid(), Some(1000));
        assert_eq!(
            host.calls(),
            vec![HostCall::Spawn {
                pid: 1000,
                script: "/proj/.devloop/a.mjs".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_restart_kills_previous_child_before_spawning() {
        let host = FakeHost::new();
        let sup = supervisor(host.clone());

        sup.start_or_restart(script("a")).await.unwrap();
        let pid = sup.start_or_restart(script("b")).await.unwrap();

        assert_eq!(pid, Coalesced::Result(Some(1001)));
        assert_eq!(
            host.calls(),
            vec![
                HostCall::Spawn {
                    pid: 1000,
                    script: "/proj/.devloop/a.mjs".into()
                },
                HostCall::Signal {
                    pid: 1000,
                    signal: TreeSignal::Terminate
                },
                HostCall::Spawn {
                    pid: 1001,
                    script: "/proj/.devloop/b.mjs".into()
                },
            ]
        );
        assert_eq!(host.max_live(), 1);
        assert_eq!(host.live_pids(), vec![1001]);
    }

    #[tokio::test]
    async fn test_crashed_child_is_not_signalled_on_restart() {
        let host = FakeHost::new();
        let sup = supervisor(host.clone());

        sup.start_or_restart(script("a")).await.unwrap();
        host.crash(1000, Some(1));
        sup.start_or_restart(script("a")).await.unwrap();

        assert_eq!(host.signal_count(), 0);
        assert_eq!(host.live_pids(), vec![1001]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_child_escalates_to_sigkill() {
        let host = FakeHost::new().ignoring_terminate();
        let sup = supervisor(host.clone());

        sup.start_or_restart(script("a")).await.unwrap();
        sup.start_or_restart(script("b")).await.unwrap();

        let signals: Vec<_> = host
            .calls()
            .into_iter()
            .filter(|c| matches!(c, HostCall::Signal { .. }))
            .collect();
        assert_eq!(
            signals,
            vec![
                HostCall::Signal {
                    pid: 1000,
                    signal: TreeSignal::Terminate
                },
                HostCall::Signal {
                    pid: 1000,
                    signal: TreeSignal::Kill
                },
            ]
        );
        assert_eq!(host.max_live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_restarts_coalesce_into_one_trailing_cycle() {
        let host = FakeHost::new().with_spawn_delay(Duration::from_millis(100));
        let sup = supervisor(host.clone());

        let driver = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start_or_restart(script("a")).await }
        });
        while !sup.is_restarting() {
            tokio::task::yield_now().await;
        }

        assert!(sup.start_or_restart(script("b")).await.unwrap().is_executing());
        assert!(sup.start_or_restart(script("c")).await.unwrap().is_executing());

        let result = driver.await.unwrap().unwrap();
        assert_eq!(result, Coalesced::Result(Some(1001)));

        // One cycle for "a", exactly one trailing cycle with the last script.
        assert_eq!(host.spawned_scripts(), vec!["/proj/.devloop/a.mjs", "/proj/.devloop/c.mjs"]);
        assert_eq!(host.max_live(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let host = FakeHost::new();
        let sup = supervisor(host.clone());
        sup.start_or_restart(script("a")).await.unwrap();

        let (first, second) = tokio::join!(sup.stop(), sup.stop());
        let third = sup.stop().await.unwrap();

        let expected = StopOutcome::Stopped {
            pid: 1000,
            code: Some(143),
        };
        assert_eq!(first.unwrap(), expected);
        assert_eq!(second.unwrap(), expected);
        assert_eq!(third, expected);
        assert_eq!(host.signal_count(), 1);
        assert_eq!(sup.current_pid(), None);
    }

    #[tokio::test]
    async fn test_stop_without_child() {
        let sup = supervisor(FakeHost::new());
        assert_eq!(sup.stop().await.unwrap(), StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_start_after_stop_does_not_spawn() {
        let host = FakeHost::new();
        let sup = supervisor(host.clone());

        sup.stop().await.unwrap();
        let result = sup.start_or_restart(script("a")).await.unwrap();

        assert_eq!(result, Coalesced::Result(None));
        assert!(host.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_restart_skips_spawn() {
        let host = FakeHost::new()
            .ignoring_terminate()
            .with_spawn_delay(Duration::from_millis(10));
        let sup = supervisor(host.clone());
        sup.start_or_restart(script("a")).await.unwrap();

        let restart = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start_or_restart(script("b")).await }
        });
        while host.signal_count() == 0 {
            tokio::task::yield_now().await;
        }

        // The restart is waiting out the grace period on pid 1000.
        let stop = sup.stop().await.unwrap();
        let result = restart.await.unwrap().unwrap();

        assert_eq!(result, Coalesced::Result(None));
        assert_eq!(stop, StopOutcome::NotRunning);
        assert_eq!(host.spawned_scripts(), vec!["/proj/.devloop/a.mjs"]);
        assert!(host.live_pids().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let host = FakeHost::new().failing_spawns();
        let sup = supervisor(host);

        let err = sup.start_or_restart(script("a")).await.unwrap_err();
        assert!(matches!(err, Error::ProcessSpawn { .. }));
        assert_eq!(sup.current_pid(), None);
    }

    #[tokio::test]
    async fn test_refused_signal_keeps_child_supervised() {
        let host = FakeHost::new().failing_signals(1);
        let sup = supervisor(host.clone());
        sup.start_or_restart(script("a")).await.unwrap();

        let err = sup.start_or_restart(script("b")).await.unwrap_err();
        assert!(err.to_string().contains("EPERM"));
        assert_eq!(sup.current_pid(), Some(1000));
        assert_eq!(host.live_pids(), vec![1000]);

        // The next restart still tears down the surviving child first.
        let pid = sup.start_or_restart(script("b")).await.unwrap();
        assert_eq!(pid, Coalesced::Result(Some(1001)));
        assert_eq!(host.max_live(), 1);
        assert_eq!(host.live_pids(), vec![1001]);

        assert_eq!(
            sup.stop().await.unwrap(),
            StopOutcome::Stopped {
                pid: 1001,
                code: Some(143)
            }
        );
        assert!(host.live_pids().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stop_can_be_retried() {
        let host = FakeHost::new().failing_signals(1);
        let sup = supervisor(host.clone());
        sup.start_or_restart(script("a")).await.unwrap();

        assert!(sup.stop().await.is_err());
        assert_eq!(host.live_pids(), vec![1000]);

        assert_eq!(
            sup.stop().await.unwrap(),
            StopOutcome::Stopped {
                pid: 1000,
                code: Some(143)
            }
        );
        assert!(host.live_pids().is_empty());
        assert_eq!(sup.current_pid(), None);
    }

    #[tokio::test]
    async fn test_child_exit_after_refused_signal_is_unexpected() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let host = FakeHost::new().failing_signals(1).with_events(tx);
        let sup = supervisor(host.clone());
        sup.start_or_restart(script("a")).await.unwrap();

        sup.start_or_restart(script("b")).await.unwrap_err();
        host.crash(1000, Some(1));

        assert_eq!(
            rx.recv().await.unwrap(),
            crate::host::ChildEvent::Exited {
                pid: 1000,
                code: Some(1),
                expected: false
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial_test::serial]
    async fn test_real_restart_terminates_previous_child() {
        use crate::host::{ChildEvent, PtyHost};
        use tokio::sync::mpsc;

        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("bootstrap.sh");
        std::fs::write(&script_path, "sleep 30\n").unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let host = PtyHost::with_ipc_dir(tx, dir.path().join("ipc"));
        let sup = Supervisor::new(
            host,
            SupervisorConfig::new(RuntimeCommand::new("sh"), dir.path())
                .with_kill_grace(Duration::from_secs(2)),
        );

        let first = sup
            .start_or_restart(BootstrapScript::new(&script_path))
            .await
            .unwrap()
            .into_result()
            .flatten()
            .unwrap();
        let second = sup
            .start_or_restart(BootstrapScript::new(&script_path))
            .await
            .unwrap()
            .into_result()
            .flatten()
            .unwrap();
        assert_ne!(first, second);

        let exited = loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                event @ ChildEvent::Exited { .. } => break event,
                ChildEvent::Message { .. } => continue,
            }
        };
        assert!(matches!(
            exited,
            ChildEvent::Exited { pid, expected: true, .. } if pid == first
        ));

        assert!(matches!(
            sup.stop().await.unwrap(),
            StopOutcome::Stopped { pid, .. } if pid == second
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial_test::serial]
    async fn test_resize_reaches_child_pty() {
        use crate::host::{ChildEvent, PtyHost};
        use tokio::sync::mpsc;

        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("resize.sh");
        std::fs::write(&script_path, "sleep 1\nstty size > size.txt\n").unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let host = PtyHost::with_ipc_dir(tx, dir.path().join("ipc"));
        let sup = Supervisor::new(
            host,
            SupervisorConfig::new(RuntimeCommand::new("sh"), dir.path()),
        );

        sup.start_or_restart(BootstrapScript::new(&script_path))
            .await
            .unwrap();
        sup.resize(TerminalSize { rows: 40, cols: 120 }).unwrap();

        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ChildEvent::Exited { code, .. } => {
                    assert_eq!(code, Some(0));
                    break;
                }
                ChildEvent::Message { .. } => continue,
            }
        }

        let size = std::fs::read_to_string(dir.path().join("size.txt")).unwrap();
        assert_eq!(size.trim(), "40 120");
    }
}
