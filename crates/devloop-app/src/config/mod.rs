//! Configuration file parsing for devloop
//!
//! Supports:
//! - `.devloop/config.toml` - Project settings
//! - Runtime program resolution (`node_modules/.bin`, then `PATH`)

pub mod runtime;
pub mod settings;
pub mod types;

pub use runtime::resolve_runtime;
pub use settings::{devloop_dir, init_config_dir, load_settings, DEVLOOP_DIR};
pub use types::*;
