//! Launch contract between devloop and the processes it spawns
//!
//! Every child receives a single [`ChildLaunchConfig`] document. The long-running
//! app child gets it inline after [`LAUNCH_ARG`]; reflection children get
//! [`LAUNCH_FROM_STDIN`] as the argument value and read the document from stdin.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::layout::Layout;

/// Command-line flag carrying the launch document
pub const LAUNCH_ARG: &str = "--devloop-launch";

/// Value of [`LAUNCH_ARG`] meaning "read the document from stdin"
pub const LAUNCH_FROM_STDIN: &str = "-";

/// Constrained execution mode of the user application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionStage {
    /// Discover the plugin set
    Plugin,
    /// Regenerate type artifacts
    Typegen,
}

impl std::fmt::Display for ReflectionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReflectionStage::Plugin => write!(f, "plugin"),
            ReflectionStage::Typegen => write!(f, "typegen"),
        }
    }
}

/// Immutable configuration handed to a child at spawn time.
///
/// `stage` absent means "not a reflection subprocess".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildLaunchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<ReflectionStage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Layout>,

    /// Set for the long-running app child; allows it to emit `server_ready`
    #[serde(default)]
    pub dev_mode: bool,

    /// Unix socket the child connects to for IPC messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipc_socket: Option<PathBuf>,
}

impl ChildLaunchConfig {
    /// Launch document for the long-running dev server child
    pub fn dev(ipc_socket: Option<PathBuf>) -> Self {
        Self {
            stage: None,
            layout: None,
            dev_mode: true,
            ipc_socket,
        }
    }

    /// Launch document for a reflection subprocess
    pub fn reflection(stage: ReflectionStage, layout: Layout) -> Self {
        Self {
            stage: Some(stage),
            layout: Some(layout),
            dev_mode: false,
            ipc_socket: None,
        }
    }

    pub fn is_reflection(&self) -> bool {
        self.stage.is_some()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
