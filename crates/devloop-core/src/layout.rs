//! Project layout and generated bootstrap script types

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Resolved description of a project: source root, entrypoint and discovered modules.
///
/// Produced by the layout scanner and snapshotted into reflection children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    pub project_root: PathBuf,
    pub source_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<PathBuf>,
    /// Discovered schema modules, absolute, sorted
    #[serde(default)]
    pub modules: Vec<PathBuf>,
}

impl Layout {
    pub fn new(project_root: impl Into<PathBuf>, source_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            source_root: source_root.into(),
            entrypoint: None,
            modules: Vec::new(),
        }
    }

    pub fn with_entrypoint(mut self, entrypoint: impl Into<PathBuf>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    pub fn with_modules(mut self, mut modules: Vec<PathBuf>) -> Self {
        modules.sort();
        modules.dedup();
        self.modules = modules;
        self
    }

    /// Path relative to the project root, or the path unchanged if outside it
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.project_root).unwrap_or(path)
    }

    /// Whether `path` lies under the source root
    pub fn contains(&self, path: &Path) -> bool {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        };
        absolute.starts_with(&self.source_root)
    }
}

/// A generated bootstrap script materialized on disk.
///
/// Opaque to the supervisor and reflection runner: they only hand its path to
/// the configured runtime program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapScript {
    path: PathBuf,
    /// Hash of the rendered contents; 0 when unknown
    fingerprint: u64,
}

impl BootstrapScript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fingerprint: 0,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: u64) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}
