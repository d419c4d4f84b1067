//! Events delivered to the dev loop controller
//!
//! Everything that can change controller state arrives as a [`DevEvent`] on a
//! single channel: watcher batches, child IPC and exits, completions of
//! background tasks, and OS signals.

use devloop_core::prelude::*;
use devloop_core::{BootstrapScript, Layout, WatchEvent};
use devloop_daemon::{ChildEvent, Coalesced, ReflectionResult, TerminalSize};

use crate::plugin::HookBatchOutcome;

#[derive(Debug)]
pub enum DevEvent {
    /// A debounced batch of watcher events, in arrival order
    FilesChanged(Vec<WatchEvent>),

    WatcherError(String),

    /// IPC message or exit of an app child
    Child(ChildEvent),

    /// A background rescan and bootstrap render finished. `None` when it was
    /// coalesced into a rescan another task is driving.
    LayoutRebuilt(Option<Result<(Layout, BootstrapScript)>>),

    /// A spawned `start_or_restart` task finished
    RestartFinished(Result<Coalesced<Option<u32>>>),

    /// A background typegen run finished. `None` when it was coalesced into
    /// an execution another task is driving.
    TypegenFinished(Option<ReflectionResult>),

    /// A plugin's hook queue drained one batch of events
    PluginHookFinished {
        plugin: String,
        outcome: HookBatchOutcome,
    },

    TerminalResized(TerminalSize),

    /// SIGINT / SIGTERM / Ctrl+C
    Shutdown,
}

impl From<ChildEvent> for DevEvent {
    fn from(event: ChildEvent) -> Self {
        DevEvent::Child(event)
    }
}
