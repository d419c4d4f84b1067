//! devloop-app - Dev loop orchestration for devloop
//!
//! This crate implements the dev loop controller state machine, configuration
//! loading, the change classifier, file watching, plugin hook dispatch, project
//! layout scanning with bootstrap generation, and the per-project session lock.

pub mod classifier;
pub mod config;
pub mod controller;
pub mod message;
pub mod plugin;
pub mod project;
pub mod session;
pub mod signals;
pub mod watcher;

// Re-export primary types
pub use classifier::{classify, Classification, ConsumerPatterns, WatchRules, WatchRulesConfig};
pub use config::Settings;
pub use controller::{DevLoop, DevLoopOptions, DevPhase};
pub use message::DevEvent;
pub use plugin::{
    CommandHook, HookBatchOutcome, HookContext, HookOutcome, HookQueue, OnFileWatcherEvent,
    OnStart, Plugin, PluginSet,
};
pub use project::{FsProject, Project};
pub use session::SessionLock;
pub use watcher::{FileWatcher, PathWatcher, WatcherConfig};
