//! File-system watch events consumed by the change classifier

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Kind of a file-system change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchEventKind {
    /// The watcher finished its initial scan of a root
    Init,
    Add,
    Change,
    Unlink,
    AddDir,
    UnlinkDir,
}

impl WatchEventKind {
    /// Events that may change the set of files itself
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            WatchEventKind::Add
                | WatchEventKind::Unlink
                | WatchEventKind::AddDir
                | WatchEventKind::UnlinkDir
        )
    }
}

impl std::fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WatchEventKind::Init => "init",
            WatchEventKind::Add => "add",
            WatchEventKind::Change => "change",
            WatchEventKind::Unlink => "unlink",
            WatchEventKind::AddDir => "addDir",
            WatchEventKind::UnlinkDir => "unlinkDir",
        };
        f.write_str(name)
    }
}

/// A single raw watcher event. Produced once, consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Project-relative when the file lives under the project root
    pub path: PathBuf,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    pub fn change(path: impl Into<PathBuf>) -> Self {
        Self::new(WatchEventKind::Change, path)
    }

    /// Path rendered with `/` separators, as glob patterns expect
    pub fn match_path(&self) -> String {
        normalize_separators(&self.path)
    }
}

impl std::fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.path.display())
    }
}

pub(crate) fn normalize_separators(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_kinds() {
        assert!(WatchEventKind::Add.is_structural());
        assert!(WatchEventKind::UnlinkDir.is_structural());
        assert!(!WatchEventKind::Change.is_structural());
        assert!(!WatchEventKind::Init.is_structural());
    }

    #[test]
    fn test_kind_serializes_camel_case() {
        let json = serde_json::to_string(&WatchEventKind::AddDir).unwrap();
        assert_eq!(json, r#""addDir""#);
    }

    #[test]
    fn test_display() {
        let event = WatchEvent::change("src/app.ts");
        assert_eq!(event.to_string(), "change src/app.ts");
    }

    #[test]
    fn test_match_path_uses_forward_slashes() {
        let event = WatchEvent::new(WatchEventKind::Add, "src\\graphql\\user.ts");
        assert_eq!(event.match_path(), "src/graphql/user.ts");
    }
}
