//! Plugin capabilities
//!
//! A plugin discovered by reflection is a [`PluginManifest`] plus the hooks
//! devloop runs on its behalf. Hooks are capability traits: a plugin carries
//! an [`OnStart`] and/or an [`OnFileWatcherEvent`] implementation, and the
//! controller dispatches through the typed [`PluginSet`] list.
//!
//! The hooks built from manifests are [`CommandHook`]s: argv commands run in
//! the project root with the event passed through the environment.
//!
//! File-watch hooks go through one [`HookQueue`] per plugin, which runs at
//! most one hook command at a time and reports each drained batch once.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc;

use devloop_core::prelude::*;
use devloop_core::{strip_ansi_codes, PluginManifest, WatchEvent, WatchEventKind};

use crate::message::DevEvent;

/// Environment variable naming the plugin a hook runs for
pub const PLUGIN_ENV: &str = "DEVLOOP_PLUGIN";
/// Environment variable carrying the event kind (`init`, `change`, ...)
pub const EVENT_ENV: &str = "DEVLOOP_EVENT";
/// Environment variable carrying the event path
pub const PATH_ENV: &str = "DEVLOOP_PATH";

/// What every hook gets to know about the session
#[derive(Debug, Clone)]
pub struct HookContext {
    pub project_root: PathBuf,
}

impl HookContext {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }
}

/// Result of a file-watch hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    /// The hook changed something the running app depends on
    RequestRestart,
}

/// Runs once after plugin discovery, before the first app start
pub trait OnStart: Send + Sync + fmt::Debug {
    fn on_start<'a>(&'a self, ctx: &'a HookContext) -> BoxFuture<'a, Result<()>>;
}

/// Runs for every watch event classified as a notification for the plugin
pub trait OnFileWatcherEvent: Send + Sync + fmt::Debug {
    fn on_file_watcher_event<'a>(
        &'a self,
        ctx: &'a HookContext,
        event: &'a WatchEvent,
    ) -> BoxFuture<'a, Result<HookOutcome>>;
}

/// One discovered plugin and its capabilities
#[derive(Debug, Clone)]
pub struct Plugin {
    manifest: PluginManifest,
    on_start: Option<Arc<dyn OnStart>>,
    on_file_watcher_event: Option<Arc<dyn OnFileWatcherEvent>>,
}

impl Plugin {
    /// A plugin with no hooks
    pub fn new(manifest: PluginManifest) -> Self {
        Self {
            manifest,
            on_start: None,
            on_file_watcher_event: None,
        }
    }

    /// Build command hooks from the manifest's worktime section
    pub fn from_manifest(manifest: PluginManifest) -> Self {
        let mut plugin = Self::new(manifest);
        let Some(worktime) = plugin.manifest.worktime.clone() else {
            return plugin;
        };

        if let Some(argv) = worktime.on_start {
            plugin.on_start = Some(Arc::new(CommandHook::new(&plugin.manifest.name, argv)));
        }
        if let Some(argv) = worktime.on_file_change {
            plugin.on_file_watcher_event = Some(Arc::new(
                CommandHook::new(&plugin.manifest.name, argv)
                    .restart_on_change(worktime.restart_on_change),
            ));
        }
        plugin
    }

    pub fn with_on_start(mut self, hook: Arc<dyn OnStart>) -> Self {
        self.on_start = Some(hook);
        self
    }

    pub fn with_on_file_watcher_event(mut self, hook: Arc<dyn OnFileWatcherEvent>) -> Self {
        self.on_file_watcher_event = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn on_start(&self) -> Option<Arc<dyn OnStart>> {
        self.on_start.clone()
    }

    pub fn on_file_watcher_event(&self) -> Option<Arc<dyn OnFileWatcherEvent>> {
        self.on_file_watcher_event.clone()
    }
}

/// The session's plugins, in discovery order
#[derive(Debug, Clone, Default)]
pub struct PluginSet {
    plugins: Vec<Plugin>,
}

impl PluginSet {
    pub fn new(plugins: Vec<Plugin>) -> Self {
        Self { plugins }
    }

    pub fn from_manifests(manifests: Vec<PluginManifest>) -> Self {
        Self::new(manifests.into_iter().map(Plugin::from_manifest).collect())
    }

    pub fn get(&self, name: &str) -> Option<&Plugin> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Plugin> {
        self.plugins.iter()
    }

    pub fn manifests(&self) -> Vec<PluginManifest> {
        self.plugins.iter().map(|p| p.manifest.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run every `on_start` hook in order. A failing hook is logged and does
    /// not stop the others.
    pub async fn run_on_start(&self, ctx: &HookContext) -> usize {
        let mut failures = 0;
        for plugin in &self.plugins {
            let Some(hook) = &plugin.on_start else {
                continue;
            };
            debug!("Running on_start for plugin {}", plugin.name());
            if let Err(e) = hook.on_start(ctx).await {
                warn!("Plugin {} on_start failed: {}", plugin.name(), e);
                failures += 1;
            }
        }
        failures
    }
}

/// Summary of the hook runs for one drained batch of events
#[derive(Debug, Default)]
pub struct HookBatchOutcome {
    pub runs: usize,
    /// A hook asked for a restart on behalf of a real change
    pub restart: bool,
    pub errors: Vec<Error>,
}

/// Run `hook` for each event in order, one at a time.
///
/// Restart requests made for `init` events are dropped: the initial scan
/// describes files the app was started with.
pub async fn run_file_hooks(
    hook: &dyn OnFileWatcherEvent,
    ctx: &HookContext,
    events: &[WatchEvent],
) -> HookBatchOutcome {
    let mut outcome = HookBatchOutcome::default();
    for event in events {
        outcome.runs += 1;
        match hook.on_file_watcher_event(ctx, event).await {
            Ok(HookOutcome::RequestRestart) if event.kind == WatchEventKind::Init => {
                trace!("Ignoring restart request for {}", event)
            }
            Ok(HookOutcome::RequestRestart) => outcome.restart = true,
            Ok(HookOutcome::Continue) => {}
            Err(e) => outcome.errors.push(e),
        }
    }
    outcome
}

/// Keep the latest event per path, ordered by when each path last changed
fn collapse(events: Vec<WatchEvent>) -> Vec<WatchEvent> {
    let mut latest: Vec<WatchEvent> = Vec::with_capacity(events.len());
    for event in events {
        latest.retain(|e| e.path != event.path);
        latest.push(event);
    }
    latest
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Vec<WatchEvent>,
    running: bool,
}

/// Serialized file-watch hook runs for one plugin.
///
/// Events pushed while a batch is running accumulate and are drained by the
/// same task once it finishes, so a burst of events never has more than one
/// hook command in flight. Each drained batch is reported as one
/// [`DevEvent::PluginHookFinished`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HookQueue {
    plugin: String,
    hook: Arc<dyn OnFileWatcherEvent>,
    ctx: HookContext,
    tx: mpsc::Sender<DevEvent>,
    state: Arc<Mutex<QueueState>>,
}

impl HookQueue {
    pub fn new(
        plugin: impl Into<String>,
        hook: Arc<dyn OnFileWatcherEvent>,
        ctx: HookContext,
        tx: mpsc::Sender<DevEvent>,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            hook,
            ctx,
            tx,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Queue `events`, starting a drain task unless one is already running
    pub fn push(&self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        let start = {
            let mut state = self.lock();
            state.pending.extend(events);
            !std::mem::replace(&mut state.running, true)
        };
        if start {
            tokio::spawn(self.clone().drain());
        } else {
            trace!("Plugin {} hook busy, events queued", self.plugin);
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    async fn drain(self) {
        loop {
            let batch = {
                let mut state = self.lock();
                if state.pending.is_empty() {
                    state.running = false;
                    return;
                }
                collapse(std::mem::take(&mut state.pending))
            };

            debug!("Running {} hook(s) for plugin {}", batch.len(), self.plugin);
            let outcome = run_file_hooks(self.hook.as_ref(), &self.ctx, &batch).await;

            let finished = DevEvent::PluginHookFinished {
                plugin: self.plugin.clone(),
                outcome,
            };
            if self.tx.send(finished).await.is_err() {
                debug!("Controller gone, dropping plugin {} hook results", self.plugin);
                self.lock().running = false;
                return;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A hook that runs an argv command in the project root
#[derive(Debug, Clone)]
pub struct CommandHook {
    plugin: String,
    argv: Vec<String>,
    restart_on_change: bool,
}

impl CommandHook {
    pub fn new(plugin: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            plugin: plugin.into(),
            argv,
            restart_on_change: false,
        }
    }

    pub fn restart_on_change(mut self, restart: bool) -> Self {
        self.restart_on_change = restart;
        self
    }

    #[instrument(level = "debug", skip(self, ctx, env), fields(plugin = %self.plugin))]
    async fn run(&self, ctx: &HookContext, env: Vec<(&'static str, String)>) -> Result<()> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(Error::config_invalid(format!(
                "plugin {} declares an empty hook command",
                self.plugin
            )));
        };

        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&ctx.project_root)
            .env(PLUGIN_ENV, &self.plugin)
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::spawn(format!("{}: {}", program, e)))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!("[{}] {}", self.plugin, line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!("[{}] {}", self.plugin, strip_ansi_codes(line));
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::process(format!(
                "plugin {} hook `{}` failed with {}",
                self.plugin,
                self.argv.join(" "),
                output.status
            )))
        }
    }
}

impl OnStart for CommandHook {
    fn on_start<'a>(&'a self, ctx: &'a HookContext) -> BoxFuture<'a, Result<()>> {
        self.run(ctx, Vec::new()).boxed()
    }
}

impl OnFileWatcherEvent for CommandHook {
    fn on_file_watcher_event<'a>(
        &'a self,
        ctx: &'a HookContext,
        event: &'a WatchEvent,
    ) -> BoxFuture<'a, Result<HookOutcome>> {
        async move {
            let env = vec![
                (EVENT_ENV, event.kind.to_string()),
                (PATH_ENV, event.match_path()),
            ];
            self.run(ctx, env).await?;
            Ok(if self.restart_on_change {
                HookOutcome::RequestRestart
            } else {
                HookOutcome::Continue
            })
        }
        .boxed()
    }
}
