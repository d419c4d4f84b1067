//! Plugin manifests reported by plugin-discovery reflection

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A plugin's static self-description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,

    /// Where the plugin's runtime part is exported from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeExport>,

    /// Dev-time hooks the orchestrator runs on the plugin's behalf
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktime: Option<WorktimeManifest>,
}

impl PluginManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runtime: None,
            worktime: None,
        }
    }

    pub fn with_worktime(mut self, worktime: WorktimeManifest) -> Self {
        self.worktime = Some(worktime);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeExport {
    pub module: PathBuf,
    #[serde(default = "default_export")]
    pub export: String,
}

fn default_export() -> String {
    "default".to_string()
}

/// Watch contribution and hook commands of a plugin.
///
/// Commands are argv vectors run in the project root.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktimeManifest {
    /// Extra patterns added to the watcher
    #[serde(default)]
    pub watch_file_patterns: Vec<String>,

    /// When set, only these files are delivered to the plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_file_patterns: Option<Vec<String>>,

    #[serde(default)]
    pub ignore_file_patterns: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_start: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_file_change: Option<Vec<String>>,

    /// Ask for a full restart after `on_file_change` succeeds
    #[serde(default)]
    pub restart_on_change: bool,
}
