//! Configuration types for devloop
//!
//! `Settings` mirrors `.devloop/config.toml` section by section. Every field
//! has a default, so a partial file (or none at all) is valid.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use devloop_daemon::RuntimeCommand;

/// Application settings (.devloop/config.toml)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub runtime: RuntimeCommand,

    #[serde(default)]
    pub project: ProjectSettings,

    #[serde(default)]
    pub watcher: WatcherSettings,

    #[serde(default)]
    pub app: AppSettings,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub reflection: ReflectionSettings,

    #[serde(default)]
    pub bootstrap: BootstrapSettings,
}

/// Where the application's sources live
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProjectSettings {
    /// Source root, relative to the project root
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,

    /// Entrypoint module, relative to the source root. Detected when unset.
    #[serde(default)]
    pub entrypoint: Option<PathBuf>,

    /// File extensions that count as modules
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            source_root: default_source_root(),
            entrypoint: None,
            extensions: default_extensions(),
        }
    }
}

fn default_source_root() -> PathBuf {
    PathBuf::from("src")
}

fn default_extensions() -> Vec<String> {
    ["ts", "tsx", "mts", "cts", "js", "mjs", "cjs"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

/// File watcher settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WatcherSettings {
    /// Globs (project-relative) of files that produce watch events
    #[serde(default = "default_watch_patterns")]
    pub watch_file_patterns: Vec<String>,

    /// Globs excluded for every consumer unless its allow list matches
    #[serde(default = "default_ignore_patterns")]
    pub ignore_file_patterns: Vec<String>,

    /// Debounce window for raw file-system events
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            watch_file_patterns: default_watch_patterns(),
            ignore_file_patterns: default_ignore_patterns(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl WatcherSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_watch_patterns() -> Vec<String> {
    ["src/**", "package.json", "tsconfig.json"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_ignore_patterns() -> Vec<String> {
    ["**/node_modules/**", "**/.git/**", ".devloop/**", "**/*.log"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_debounce_ms() -> u64 {
    100
}

/// Watch rules for the app consumer (the one that restarts the child)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppSettings {
    /// Files matching these are delivered even if the shared ignore list matches
    #[serde(default)]
    pub allow_file_patterns: Option<Vec<String>>,

    #[serde(default)]
    pub ignore_file_patterns: Vec<String>,
}

/// App child supervision
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SupervisorSettings {
    /// Time between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Extra environment for the app child and reflection children
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            kill_grace_ms: default_kill_grace_ms(),
            env: BTreeMap::new(),
        }
    }
}

impl SupervisorSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn default_kill_grace_ms() -> u64 {
    5000
}

/// Reflection runs
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReflectionSettings {
    /// Regenerate type artifacts after every successful restart
    #[serde(default = "default_true")]
    pub typegen: bool,

    /// Give up on a reflection run after this long. 0 = no limit.
    #[serde(default)]
    pub timeout_ms: u64,

    /// Time a finished reflection child gets to exit before it is killed
    #[serde(default = "default_exit_grace_ms")]
    pub exit_grace_ms: u64,
}

impl Default for ReflectionSettings {
    fn default() -> Self {
        Self {
            typegen: true,
            timeout_ms: 0,
            exit_grace_ms: default_exit_grace_ms(),
        }
    }
}

impl ReflectionSettings {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }
}

fn default_exit_grace_ms() -> u64 {
    2000
}

/// Generated bootstrap script
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BootstrapSettings {
    /// File name inside `.devloop/`
    #[serde(default = "default_bootstrap_file")]
    pub file_name: String,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            file_name: default_bootstrap_file(),
        }
    }
}

fn default_bootstrap_file() -> String {
    "bootstrap.mjs".to_string()
}

fn default_true() -> bool {
    true
}
