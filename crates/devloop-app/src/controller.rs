//! Dev loop controller
//!
//! Owns the session state machine:
//!
//! ```text
//! Idle -> InitialReflection -> Reflecting -> Running -> (FullRestart) -> Reflecting -> Running ... -> Stopped
//! ```
//!
//! All state lives on the controller task and is changed only by
//! [`DevLoop::process_event`]. Long-running work (layout rescans, restarts,
//! typegen runs, plugin hooks) runs in spawned tasks that report back as
//! [`DevEvent`]s, so bursts of file events coalesce instead of queueing here.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use devloop_core::prelude::*;
use devloop_core::{BootstrapScript, Layout, Message, PluginManifest, WatchEvent};
use devloop_daemon::{
    ChildEvent, Coalesced, Coalescer, ProcessHost, ReflectionMode, ReflectionResult, Reflector,
    StopOutcome, Supervisor,
};

use crate::classifier::{classify, WatchRules, WatchRulesConfig};
use crate::message::DevEvent;
use crate::plugin::{HookBatchOutcome, HookContext, HookQueue, Plugin, PluginSet};
use crate::project::Project;
use crate::watcher::PathWatcher;

/// Capacity of the controller's event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevPhase {
    Idle,
    /// Discovering plugins before the first start
    InitialReflection,
    /// A restart is in flight
    Reflecting,
    Running,
    Stopped,
}

/// Session options that are not owned by a collaborator
#[derive(Debug, Clone, Default)]
pub struct DevLoopOptions {
    /// Watch rules from config; plugin contributions are added after discovery
    pub rules: WatchRulesConfig,
    /// Regenerate type artifacts after each successful start
    pub typegen: bool,
}

type TypegenRun = Coalescer<(BootstrapScript, Layout), ReflectionResult>;

/// Rescan plus bootstrap render, off the controller task
type Rebuild = Coalescer<Vec<PluginManifest>, Result<(Layout, BootstrapScript)>>;

pub struct DevLoop<H, R, P> {
    project: Arc<P>,
    supervisor: Supervisor<H>,
    reflector: Arc<R>,
    watcher: Box<dyn PathWatcher>,
    options: DevLoopOptions,
    hook_ctx: HookContext,

    tx: mpsc::Sender<DevEvent>,
    rx: mpsc::Receiver<DevEvent>,
    child_rx: mpsc::Receiver<ChildEvent>,

    phase: DevPhase,
    plugins: PluginSet,
    rules: Option<WatchRules>,
    layout: Option<Layout>,
    script: Option<BootstrapScript>,
    typegen: TypegenRun,
    rebuild: Rebuild,
    hook_queues: HashMap<String, HookQueue>,
    extra_watched: HashSet<PathBuf>,
    ready_pid: Option<u32>,
}

impl<H, R, P> DevLoop<H, R, P>
where
    H: ProcessHost + Sync + 'static,
    R: Reflector + Sync + 'static,
    P: Project + 'static,
{
    /// `child_rx` receives the events of the host behind `supervisor`
    pub fn new(
        project: P,
        supervisor: Supervisor<H>,
        reflector: R,
        watcher: Box<dyn PathWatcher>,
        child_rx: mpsc::Receiver<ChildEvent>,
        options: DevLoopOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let project = Arc::new(project);
        let reflector = Arc::new(reflector);

        let typegen_reflector = Arc::clone(&reflector);
        let typegen = Coalescer::new(move |(script, layout): (BootstrapScript, Layout)| {
            let reflector = Arc::clone(&typegen_reflector);
            async move {
                reflector
                    .reflect(&script, &layout, ReflectionMode::Artifacts)
                    .await
            }
        });

        let rebuild_project = Arc::clone(&project);
        let rebuild = Coalescer::new(move |manifests: Vec<PluginManifest>| {
            let project = Arc::clone(&rebuild_project);
            async move {
                tokio::task::spawn_blocking(move || {
                    let layout = project.scan()?;
                    let script = project.render_bootstrap(&layout, &manifests)?;
                    Ok::<_, Error>((layout, script))
                })
                .await
                .map_err(|e| Error::process(format!("layout rescan task failed: {}", e)))?
            }
        });

        Self {
            hook_ctx: HookContext::new(project.root()),
            project,
            supervisor,
            reflector,
            watcher,
            options,
            tx,
            rx,
            child_rx,
            phase: DevPhase::Idle,
            plugins: PluginSet::default(),
            rules: None,
            layout: None,
            script: None,
            typegen,
            rebuild,
            hook_queues: HashMap::new(),
            extra_watched: HashSet::new(),
            ready_pid: None,
        }
    }

    /// Sender for events from outside the loop (signals, resizes)
    pub fn sender(&self) -> mpsc::Sender<DevEvent> {
        self.tx.clone()
    }

    pub fn phase(&self) -> DevPhase {
        self.phase
    }

    pub fn plugins(&self) -> &PluginSet {
        &self.plugins
    }

    /// Pid of the child that reported `server_ready`, if it is still current
    pub fn ready_pid(&self) -> Option<u32> {
        self.ready_pid
            .filter(|pid| Some(*pid) == self.supervisor.current_pid())
    }

    /// Start the session and process events until shutdown
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = self.start().await {
            self.shutdown().await?;
            return Err(e);
        }

        while let Some(event) = self.next_event().await {
            match self.process_event(event).await {
                Ok(ControlFlow::Break(())) => break,
                Ok(ControlFlow::Continue(())) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!("{}", e),
            }
        }
        Ok(())
    }

    /// Initial reflection: discover plugins, run their start hooks, start
    /// watching and request the first start. Any failure here is fatal.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<()> {
        self.phase = DevPhase::InitialReflection;

        let layout = self.project.scan()?;
        let script = self.project.render_bootstrap(&layout, &[])?;

        info!("Discovering plugins...");
        let manifests = self
            .reflector
            .reflect(&script, &layout, ReflectionMode::UsedPlugins)
            .await
            .into_plugins()?;
        self.plugins = PluginSet::from_manifests(manifests);
        info!(
            "Found {} plugin(s){}",
            self.plugins.len(),
            plugin_list(&self.plugins)
        );

        let manifests = self.plugins.manifests();
        let script = self.project.render_bootstrap(&layout, &manifests)?;

        let failures = self.plugins.run_on_start(&self.hook_ctx).await;
        if failures > 0 {
            warn!("{} plugin on_start hook(s) failed", failures);
        }

        self.hook_queues = self
            .plugins
            .iter()
            .filter_map(|plugin| {
                let hook = plugin.on_file_watcher_event()?;
                let queue =
                    HookQueue::new(plugin.name(), hook, self.hook_ctx.clone(), self.tx.clone());
                Some((plugin.name().to_string(), queue))
            })
            .collect();

        let rules = self
            .options
            .rules
            .clone()
            .with_plugins(&manifests)
            .compile()?;
        self.watcher.start(rules.clone(), self.tx.clone())?;
        self.rules = Some(rules);
        self.layout = Some(layout);

        self.request_restart(script);
        Ok(())
    }

    /// Next event from either the controller channel or the child host
    pub async fn next_event(&mut self) -> Option<DevEvent> {
        tokio::select! {
            Some(event) = self.rx.recv() => Some(event),
            Some(event) = self.child_rx.recv() => Some(event.into()),
            else => None,
        }
    }

    /// Apply one event. Breaks after shutdown.
    pub async fn process_event(&mut self, event: DevEvent) -> Result<ControlFlow<()>> {
        match event {
            DevEvent::FilesChanged(batch) => self.handle_files_changed(batch),
            DevEvent::WatcherError(message) => warn!("File watcher error: {}", message),
            DevEvent::Child(ChildEvent::Message { pid, message }) => {
                self.handle_child_message(pid, message)
            }
            DevEvent::Child(ChildEvent::Exited {
                pid,
                code,
                expected,
            }) => self.handle_child_exit(pid, code, expected),
            DevEvent::LayoutRebuilt(result) => self.handle_layout_rebuilt(result),
            DevEvent::RestartFinished(result) => self.handle_restart_finished(result),
            DevEvent::TypegenFinished(result) => handle_typegen_finished(result),
            DevEvent::PluginHookFinished { plugin, outcome } => {
                self.handle_hooks_finished(&plugin, outcome)
            }
            DevEvent::TerminalResized(size) => {
                if let Err(e) = self.supervisor.resize(size) {
                    debug!("Failed to resize child pty: {}", e);
                }
            }
            DevEvent::Shutdown => {
                self.shutdown().await?;
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Stop watching and stop the app child
    pub async fn shutdown(&mut self) -> Result<StopOutcome> {
        self.phase = DevPhase::Stopped;
        self.watcher.stop();

        let outcome = self.supervisor.stop().await?;
        match outcome {
            StopOutcome::NotRunning => info!("Stopped"),
            StopOutcome::Stopped { pid, code } => {
                info!("Stopped app (pid {}, exit code {:?})", pid, code)
            }
            StopOutcome::Unresponsive { pid } => {
                warn!("App (pid {}) did not exit after SIGKILL", pid)
            }
        }
        Ok(outcome)
    }

    fn handle_files_changed(&mut self, batch: Vec<WatchEvent>) {
        let Some(rules) = &self.rules else {
            return;
        };

        let mut restart_cause = None;
        let mut notifications: Vec<(String, Vec<WatchEvent>)> = Vec::new();
        for event in batch {
            let classification = classify(&event, rules);
            if classification.is_ignored() {
                continue;
            }
            for plugin in classification.plugins {
                match notifications.iter_mut().find(|(name, _)| *name == plugin) {
                    Some((_, events)) => events.push(event.clone()),
                    None => notifications.push((plugin, vec![event.clone()])),
                }
            }
            if classification.restart && restart_cause.is_none() {
                restart_cause = Some(event);
            }
        }

        for (plugin, events) in notifications {
            self.dispatch_plugin_events(&plugin, events);
        }

        if let Some(cause) = restart_cause {
            info!("Change detected ({}), restarting", cause);
            self.full_restart();
        }
    }

    /// Rescan the layout, re-render the bootstrap and restart the app.
    ///
    /// Every restart rescans, plain content changes included. The rescan runs
    /// on a blocking thread; requests made while one is running collapse into
    /// a single trailing rescan.
    fn full_restart(&mut self) {
        if self.phase == DevPhase::Stopped {
            return;
        }
        self.phase = DevPhase::Reflecting;

        let rebuild = self.rebuild.clone();
        let manifests = self.plugins.manifests();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = rebuild.call(manifests).await.into_result();
            let _ = tx.send(DevEvent::LayoutRebuilt(result)).await;
        });
    }

    fn handle_layout_rebuilt(&mut self, result: Option<Result<(Layout, BootstrapScript)>>) {
        match result {
            None => trace!("Rescan request coalesced into the running rescan"),
            Some(Ok((layout, script))) => {
                self.layout = Some(layout);
                self.request_restart(script);
            }
            Some(Err(e)) => {
                error!("Failed to rebuild bootstrap: {}", e);
                if self.phase != DevPhase::Stopped && !self.supervisor.is_restarting() {
                    self.phase = DevPhase::Running;
                }
            }
        }
    }

    /// Spawn `start_or_restart` so bursts coalesce in the supervisor
    fn request_restart(&mut self, script: BootstrapScript) {
        if self.phase == DevPhase::Stopped {
            return;
        }
        self.phase = DevPhase::Reflecting;
        self.script = Some(script.clone());

        let supervisor = self.supervisor.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = supervisor.start_or_restart(script).await;
            let _ = tx.send(DevEvent::RestartFinished(result)).await;
        });
    }

    fn handle_restart_finished(&mut self, result: Result<Coalesced<Option<u32>>>) {
        match result {
            Ok(Coalesced::Executing) => {
                trace!("Restart request coalesced into the running restart");
            }
            Ok(Coalesced::Result(Some(pid))) => {
                if self.phase != DevPhase::Stopped {
                    self.phase = DevPhase::Running;
                }
                info!("App started (pid {})", pid);
                if self.options.typegen {
                    self.spawn_typegen();
                }
            }
            Ok(Coalesced::Result(None)) => {
                debug!("Restart skipped: supervisor is stopping");
            }
            Err(e) => {
                if self.phase != DevPhase::Stopped {
                    self.phase = DevPhase::Running;
                }
                error!("Failed to start app: {}", e);
            }
        }
    }

    fn spawn_typegen(&self) {
        let (Some(script), Some(layout)) = (self.script.clone(), self.layout.clone()) else {
            return;
        };
        let typegen = self.typegen.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = typegen.call((script, layout)).await.into_result();
            let _ = tx.send(DevEvent::TypegenFinished(result)).await;
        });
    }

    fn dispatch_plugin_events(&self, plugin: &str, events: Vec<WatchEvent>) {
        let Some(queue) = self.hook_queues.get(plugin) else {
            trace!("Plugin {} has no file-watch hook", plugin);
            return;
        };
        debug!("Notifying plugin {} of {} event(s)", plugin, events.len());
        queue.push(events);
    }

    fn handle_hooks_finished(&mut self, plugin: &str, outcome: HookBatchOutcome) {
        for e in &outcome.errors {
            warn!("Plugin {} hook failed: {}", plugin, e);
        }
        if outcome.restart {
            info!("Plugin {} requested a restart", plugin);
            self.full_restart();
        } else {
            debug!("Plugin {} hooks finished ({} run(s))", plugin, outcome.runs);
        }
    }

    fn handle_child_message(&mut self, pid: u32, message: Message) {
        let current = self.supervisor.current_pid() == Some(pid);
        match message {
            Message::ModuleImported { file_path } => {
                if current {
                    self.watch_module(file_path);
                }
            }
            Message::UncaughtError {
                error,
                stack,
                will_terminate,
            } => {
                error!("Uncaught error in app (pid {}): {}", pid, error);
                log_stack(&stack, will_terminate);
            }
            Message::UnhandledRejection {
                error,
                stack,
                will_terminate,
            } => {
                error!("Unhandled rejection in app (pid {}): {}", pid, error);
                log_stack(&stack, will_terminate);
            }
            Message::ServerReady => {
                if current {
                    info!("Server ready (pid {})", pid);
                    self.ready_pid = Some(pid);
                } else {
                    debug!("Ignoring server_ready from stale pid {}", pid);
                }
            }
            Message::ReflectionSuccessPlugin { .. }
            | Message::ReflectionSuccessTypegen
            | Message::ReflectionError { .. } => {
                warn!(
                    "Unexpected reflection message from app child {}: {}",
                    pid,
                    message.summary()
                );
            }
        }
    }

    fn handle_child_exit(&mut self, pid: u32, code: Option<i32>, expected: bool) {
        if self.ready_pid == Some(pid) {
            self.ready_pid = None;
        }

        if expected {
            debug!("App (pid {}) exited with {:?} as requested", pid, code);
        } else if self.supervisor.current_pid() == Some(pid) {
            warn!(
                "App (pid {}) exited unexpectedly with code {:?}; waiting for changes",
                pid, code
            );
        } else {
            debug!("Stale app (pid {}) exited with {:?}", pid, code);
        }
    }

    /// Watch a module the app imported when the watch patterns miss it
    fn watch_module(&mut self, file_path: PathBuf) {
        let root = self.project.root();
        let path = if file_path.is_absolute() {
            file_path
        } else {
            root.join(file_path)
        };
        if self.extra_watched.contains(&path) {
            return;
        }

        let covered = match (&self.rules, path.strip_prefix(&root)) {
            (Some(rules), Ok(relative)) => {
                rules.is_watched(&relative.to_string_lossy().replace('\\', "/"))
            }
            _ => false,
        };
        if covered {
            return;
        }

        match self.watcher.add_path(path.clone()) {
            Ok(()) => {
                debug!("Watching imported module {}", path.display());
                self.extra_watched.insert(path);
            }
            Err(e) => warn!("Failed to watch {}: {}", path.display(), e),
        }
    }
}

fn handle_typegen_finished(result: Option<ReflectionResult>) {
    match result {
        None => trace!("Typegen request coalesced into the running typegen"),
        Some(ReflectionResult::Artifacts) => info!("Type artifacts generated"),
        Some(ReflectionResult::Failure(failure)) => {
            warn!("Type generation failed: {}", failure)
        }
        Some(ReflectionResult::Plugins(_)) => {
            warn!("Typegen run answered with a plugin result")
        }
    }
}

fn log_stack(stack: &str, will_terminate: bool) {
    if !stack.is_empty() {
        debug!("{}", stack);
    }
    if will_terminate {
        info!("The app will exit; waiting for changes");
    }
}

fn plugin_list(plugins: &PluginSet) -> String {
    if plugins.is_empty() {
        return String::new();
    }
    let names: Vec<&str> = plugins.iter().map(Plugin::name).collect();
    format!(": {}", names.join(", "))
}
