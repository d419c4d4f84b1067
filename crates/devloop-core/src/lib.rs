//! # devloop-core - Core Domain Types
//!
//! Foundation crate for devloop. Provides domain types, the IPC envelope,
//! the child launch contract, error handling and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, regex, tracing).
//!
//! ## Public API
//!
//! ### Watch Events (`events`)
//! - [`WatchEvent`] - A raw file-system event with a project-relative path
//! - [`WatchEventKind`] - init / add / change / unlink / addDir / unlinkDir
//!
//! ### IPC (`ipc`)
//! - [`Message`] - Closed set of messages a child can send
//! - [`encode_line()`], [`decode_line()`] - Line-delimited JSON codec
//!
//! ### Launch Contract (`launch`)
//! - [`ChildLaunchConfig`] - Immutable config handed to a child at spawn time
//! - [`ReflectionStage`] - `plugin` or `typegen`
//!
//! ### Project (`layout`, `manifest`)
//! - [`Layout`] - Source root, entrypoint and discovered modules
//! - [`BootstrapScript`] - Generated script materialized on disk
//! - [`PluginManifest`] - A plugin's static self-description
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context

pub mod ansi;
pub mod error;
pub mod events;
pub mod ipc;
pub mod launch;
pub mod layout;
pub mod logging;
pub mod manifest;

/// Prelude for common imports used throughout all devloop crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

pub use ansi::{contains_ansi_codes, strip_ansi_codes};
pub use error::{Error, Result, ResultExt};
pub use events::{WatchEvent, WatchEventKind};
pub use ipc::{decode_line, encode_line, Message, ReflectionErrorKind, SerializedError};
pub use launch::{ChildLaunchConfig, ReflectionStage, LAUNCH_ARG, LAUNCH_FROM_STDIN};
pub use layout::{BootstrapScript, Layout};
pub use manifest::{PluginManifest, RuntimeExport, WorktimeManifest};
