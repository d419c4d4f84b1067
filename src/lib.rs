//! devloop - development-mode process orchestrator
//!
//! Wires the PTY process host, the reflection runner, the file-system project
//! and the file watcher into a [`DevLoop`] and runs it until shutdown.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use devloop_app::config::{init_config_dir, load_settings, resolve_runtime, Settings};
use devloop_app::controller::EVENT_CHANNEL_CAPACITY;
use devloop_app::signals::{spawn_resize_handler, spawn_signal_handler};
use devloop_app::{
    DevLoop, DevLoopOptions, FileWatcher, FsProject, SessionLock, WatchRulesConfig, WatcherConfig,
};
use devloop_core::prelude::*;
use devloop_daemon::{PtyHost, ReflectionRunner, Supervisor, SupervisorConfig};

pub use devloop_core::{Error, Result};

/// Command-line overrides applied on top of `.devloop/config.toml`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip type-generation reflection after each restart
    pub no_typegen: bool,
}

/// Run the dev loop for the project at `project_path` until a shutdown signal
pub async fn run_with_project(project_path: &Path, options: RunOptions) -> Result<()> {
    let root = dunce::canonicalize(project_path).map_err(|_| Error::NoProject {
        path: project_path.to_path_buf(),
    })?;

    info!("devloop starting");
    info!("Project: {}", root.display());

    let _lock = SessionLock::acquire(&root)?;
    let settings = load_settings(&root);

    let result = run_dev_loop(root, settings, options).await;

    if let Err(ref e) = result {
        error!("devloop failed: {}", e);
    }

    info!("devloop exiting");
    result
}

async fn run_dev_loop(root: PathBuf, settings: Settings, options: RunOptions) -> Result<()> {
    let runtime = resolve_runtime(&settings.runtime, &root)?;
    let env = settings.supervisor.env_pairs();

    let (child_tx, child_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let host = PtyHost::new(child_tx);
    let supervisor = Supervisor::new(
        host,
        SupervisorConfig::new(runtime.clone(), &root)
            .with_kill_grace(settings.supervisor.kill_grace())
            .with_env(env.clone()),
    );

    let reflector = ReflectionRunner::new(runtime, &root)
        .with_timeout(settings.reflection.timeout())
        .with_exit_grace(settings.reflection.exit_grace())
        .with_env(env);

    let project = FsProject::new(&root, &settings)?;
    let watcher = FileWatcher::new(
        root.clone(),
        WatcherConfig::new().with_debounce(settings.watcher.debounce()),
    );

    let options = DevLoopOptions {
        rules: WatchRulesConfig::from_settings(&settings),
        typegen: settings.reflection.typegen && !options.no_typegen,
    };

    let dev = DevLoop::new(
        project,
        supervisor,
        reflector,
        Box::new(watcher),
        child_rx,
        options,
    );

    spawn_signal_handler(dev.sender());
    spawn_resize_handler(dev.sender());

    dev.run().await
}

/// Write a default `.devloop/config.toml`, returning its path
pub fn init_project(project_path: &Path) -> Result<PathBuf> {
    let path = init_config_dir(project_path)?;
    info!("Config at {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_project_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();

        let first = init_project(temp.path()).unwrap();
        std::fs::write(&first, "[watcher]\ndebounce_ms = 5\n").unwrap();
        let second = init_project(temp.path()).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            std::fs::read_to_string(&second).unwrap(),
            "[watcher]\ndebounce_ms = 5\n"
        );
    }

    #[tokio::test]
    async fn test_missing_project_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("nope");

        let err = run_with_project(&missing, RunOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoProject { .. }));
        assert!(err.is_fatal());
    }
}
