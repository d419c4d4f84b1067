//! # devloop-daemon - Child Process Plumbing
//!
//! Runs and supervises the children devloop starts: the long-running app child
//! (attached to a pseudo-terminal, reporting over a per-child IPC socket) and
//! short-lived reflection children.
//!
//! Depends on [`devloop_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Coalescing
//! - [`Coalescer`] - At most one execution in flight, one trailing execution
//! - [`Coalesced`] - `Executing` or the driving caller's `Result`
//!
//! ### Supervision
//! - [`Supervisor`] - `start_or_restart` / `stop` for the app child
//! - [`ProcessHost`] - Spawn and signal seam; [`PtyHost`] is the real one
//! - [`ChildEvent`] - IPC messages and exits of app children
//! - [`signal_tree()`] - Signal a process and all of its descendants
//!
//! ### Reflection
//! - [`ReflectionRunner`] - Runs the app in `plugin` or `typegen` stage
//! - [`Reflector`] - Seam for the controller; [`ReflectionResult`] is its output

pub mod coalesce;
pub mod host;
#[cfg(unix)]
pub mod ipc_socket;
pub mod process_tree;
pub mod pty;
pub mod reflection;
pub mod supervisor;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use coalesce::{Coalesced, Coalescer};
pub use host::{
    ChildEvent, ChildHandle, ExitReporter, LaunchSpec, LocalProcessHost, ProcessHost, PtyHost,
    RuntimeCommand,
};
pub use process_tree::{collect_tree, signal_tree, TreeSignal};
pub use pty::{current_terminal_size, TerminalSize};
pub use reflection::{
    LocalReflector, ReflectionCollector, ReflectionFailure, ReflectionMode, ReflectionResult,
    ReflectionRunner, Reflector, RunnerEvent,
};
pub use supervisor::{StopOutcome, Supervisor, SupervisorConfig, DEFAULT_KILL_GRACE};
