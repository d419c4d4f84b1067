//! Test doubles for the process host and the reflector
//!
//! [`FakeHost`] hands out sequential pids starting at 1000 and records every
//! spawn and signal. [`FakeReflector`] replays scripted results.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use devloop_core::prelude::*;
use devloop_core::{BootstrapScript, Layout};

use crate::host::{ChildEvent, ChildHandle, ExitReporter, LaunchSpec, ProcessHost};
use crate::process_tree::TreeSignal;
use crate::reflection::{ReflectionMode, ReflectionResult, Reflector};

/// First pid handed out by [`FakeHost`]
pub const FIRST_FAKE_PID: u32 = 1000;

/// Exit code reported for a fake child stopped with SIGTERM
pub const TERMINATED_CODE: i32 = 143;

/// Exit code reported for a fake child stopped with SIGKILL
pub const KILLED_CODE: i32 = 137;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Spawn { pid: u32, script: PathBuf },
    Signal { pid: u32, signal: TreeSignal },
}

#[derive(Default)]
struct FakeHostState {
    next_pid: AtomicU32,
    calls: Mutex<Vec<HostCall>>,
    live: Mutex<HashMap<u32, ExitReporter>>,
    max_live: AtomicUsize,
    ignore_terminate: AtomicBool,
    fail_spawns: AtomicBool,
    fail_signals: AtomicUsize,
    spawn_delay: Mutex<Option<Duration>>,
    event_tx: Mutex<Option<mpsc::Sender<ChildEvent>>>,
}

/// In-memory [`ProcessHost`]
#[derive(Clone)]
pub struct FakeHost {
    state: Arc<FakeHostState>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        let state = FakeHostState {
            next_pid: AtomicU32::new(FIRST_FAKE_PID),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// Report exits and IPC messages on `tx`, like the real host does
    pub fn with_events(self, tx: mpsc::Sender<ChildEvent>) -> Self {
        *self.state.event_tx.lock().unwrap() = Some(tx);
        self
    }

    /// Children survive SIGTERM and only die on SIGKILL
    pub fn ignoring_terminate(self) -> Self {
        self.state.ignore_terminate.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_spawns(self) -> Self {
        self.state.fail_spawns.store(true, Ordering::SeqCst);
        self
    }

    /// The next `count` signal deliveries fail as if the kernel refused them
    pub fn failing_signals(self, count: usize) -> Self {
        self.state.fail_signals.store(count, Ordering::SeqCst);
        self
    }

    /// Every spawn takes this long (use with paused tokio time)
    pub fn with_spawn_delay(self, delay: Duration) -> Self {
        *self.state.spawn_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn spawned_scripts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::Spawn { script, .. } => Some(script.to_string_lossy().into_owned()),
                HostCall::Signal { .. } => None,
            })
            .collect()
    }

    pub fn signal_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, HostCall::Signal { .. }))
            .count()
    }

    pub fn live_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.state.live.lock().unwrap().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Highest number of simultaneously live children ever observed
    pub fn max_live(&self) -> usize {
        self.state.max_live.load(Ordering::SeqCst)
    }

    /// Make a child exit on its own
    pub fn crash(&self, pid: u32, code: Option<i32>) {
        self.exit(pid, code);
    }

    /// Deliver an IPC message as if `pid` had written it to its socket
    pub fn send_message(&self, pid: u32, message: devloop_core::Message) {
        if let Some(tx) = self.state.event_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(ChildEvent::Message { pid, message });
        }
    }

    fn exit(&self, pid: u32, code: Option<i32>) -> bool {
        let Some(reporter) = self.state.live.lock().unwrap().remove(&pid) else {
            return false;
        };
        let expected = reporter.report(code);
        if let Some(tx) = self.state.event_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(ChildEvent::Exited {
                pid,
                code,
                expected,
            });
        }
        true
    }
}

impl ProcessHost for FakeHost {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ChildHandle> {
        let delay = *self.state.spawn_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.state.fail_spawns.load(Ordering::SeqCst) {
            return Err(Error::spawn(format!(
                "{}: No such file or directory",
                spec.program.display()
            )));
        }

        let pid = self.state.next_pid.fetch_add(1, Ordering::SeqCst);
        let (handle, reporter) = ChildHandle::new(pid, None);

        let live = {
            let mut live = self.state.live.lock().unwrap();
            live.insert(pid, reporter);
            live.len()
        };
        self.state.max_live.fetch_max(live, Ordering::SeqCst);

        self.state.calls.lock().unwrap().push(HostCall::Spawn {
            pid,
            script: spec.script().map(PathBuf::from).unwrap_or_default(),
        });
        Ok(handle)
    }

    fn signal_tree(&self, pid: u32, signal: TreeSignal) -> Result<bool> {
        self.state
            .calls
            .lock()
            .unwrap()
            .push(HostCall::Signal { pid, signal });

        let refused = self
            .state
            .fail_signals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::process(format!(
                "failed to send {} to pid {}: EPERM: Operation not permitted",
                signal, pid
            )));
        }

        match signal {
            TreeSignal::Terminate if self.state.ignore_terminate.load(Ordering::SeqCst) => {
                Ok(self.state.live.lock().unwrap().contains_key(&pid))
            }
            TreeSignal::Terminate => Ok(self.exit(pid, Some(TERMINATED_CODE))),
            TreeSignal::Kill => Ok(self.exit(pid, Some(KILLED_CODE))),
        }
    }
}

#[derive(Default)]
struct FakeReflectorState {
    results: Mutex<VecDeque<ReflectionResult>>,
    calls: Mutex<Vec<(ReflectionMode, PathBuf)>>,
    delay: Mutex<Option<Duration>>,
}

/// [`Reflector`] that replays queued results.
///
/// With an empty queue, plugin runs succeed with no plugins and typegen runs
/// produce artifacts.
#[derive(Clone, Default)]
pub struct FakeReflector {
    state: Arc<FakeReflectorState>,
}

impl FakeReflector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(self, result: ReflectionResult) -> Self {
        self.push_result(result);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.state.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn push_result(&self, result: ReflectionResult) {
        self.state.results.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<(ReflectionMode, PathBuf)> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn count(&self, mode: ReflectionMode) -> usize {
        self.calls().iter().filter(|(m, _)| *m == mode).count()
    }
}

impl Reflector for FakeReflector {
    async fn reflect(
        &self,
        script: &BootstrapScript,
        _layout: &Layout,
        mode: ReflectionMode,
    ) -> ReflectionResult {
        self.state
            .calls
            .lock()
            .unwrap()
            .push((mode, script.path().to_path_buf()));

        let delay = *self.state.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.state.results.lock().unwrap().pop_front();
        scripted.unwrap_or(match mode {
            ReflectionMode::UsedPlugins => ReflectionResult::Plugins(Vec::new()),
            ReflectionMode::Artifacts => ReflectionResult::Artifacts,
        })
    }
}
