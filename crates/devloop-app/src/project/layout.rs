//! Project layout scanning
//!
//! Walks the source root and produces a [`Layout`]: the modules the bootstrap
//! script imports and the entrypoint it starts.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use devloop_core::prelude::*;
use devloop_core::Layout;

use crate::config::ProjectSettings;

/// Entrypoint stems tried, in order, when none is configured
pub const ENTRYPOINT_CANDIDATES: &[&str] = &["index", "main", "app", "server"];

#[derive(Debug, Clone)]
pub struct LayoutScanner {
    project_root: PathBuf,
    settings: ProjectSettings,
    ignore: GlobSet,
}

impl LayoutScanner {
    /// `ignore_patterns` are project-relative globs excluded from discovery
    pub fn new(
        project_root: impl Into<PathBuf>,
        settings: ProjectSettings,
        ignore_patterns: &[String],
    ) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in ignore_patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(false)
                .build()
                .map_err(|e| Error::config_invalid(format!("invalid glob '{}': {}", pattern, e)))?;
            builder.add(glob);
        }
        let ignore = builder
            .build()
            .map_err(|e| Error::config_invalid(format!("invalid glob set: {}", e)))?;

        Ok(Self {
            project_root: project_root.into(),
            settings,
            ignore,
        })
    }

    pub fn source_root(&self) -> PathBuf {
        self.project_root.join(&self.settings.source_root)
    }

    #[instrument(level = "debug", skip(self), fields(root = %self.project_root.display()))]
    pub fn scan(&self) -> Result<Layout> {
        let source_root = self.source_root();
        if !source_root.is_dir() {
            return Err(Error::NoProject { path: source_root });
        }

        let modules = self.discover_modules(&source_root);
        let entrypoint = self.entrypoint(&source_root)?;

        debug!(
            "Scanned {} module(s), entrypoint {:?}",
            modules.len(),
            entrypoint
        );

        let layout = Layout::new(&self.project_root, source_root).with_modules(modules);
        Ok(match entrypoint {
            Some(entrypoint) => layout.with_entrypoint(entrypoint),
            None => layout,
        })
    }

    fn discover_modules(&self, source_root: &Path) -> Vec<PathBuf> {
        let root = self.project_root.clone();
        let ignored = self.ignore.clone();
        let mut walker = ignore::WalkBuilder::new(source_root);
        walker
            .standard_filters(false)
            .filter_entry(move |entry| !is_ignored(&ignored, &root, entry.path()));

        walker
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    trace!("Layout scan skipped an entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
            .map(ignore::DirEntry::into_path)
            .filter(|path| self.is_module(path))
            .collect()
    }

    fn is_module(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.ends_with(".d.ts") || name.ends_with(".d.mts") || name.ends_with(".d.cts") {
            return false;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.settings.extensions.iter().any(|e| e == ext))
    }

    fn entrypoint(&self, source_root: &Path) -> Result<Option<PathBuf>> {
        if let Some(configured) = &self.settings.entrypoint {
            let path = source_root.join(configured);
            if !path.is_file() {
                return Err(Error::config_invalid(format!(
                    "entrypoint {} does not exist",
                    path.display()
                )));
            }
            return Ok(Some(path));
        }

        for stem in ENTRYPOINT_CANDIDATES {
            for ext in &self.settings.extensions {
                let candidate = source_root.join(format!("{}.{}", stem, ext));
                if candidate.is_file() {
                    return Ok(Some(candidate));
                }
            }
        }
        Ok(None)
    }
}

fn is_ignored(patterns: &GlobSet, root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let relative = relative.to_string_lossy().replace('\\', "/");
    patterns.is_match(&relative) || patterns.is_match(format!("{}/", relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project(files: &[&str]) -> TempDir {
        let temp = tempfile::tempdir().unwrap();
        for file in files {
            let path = temp.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, "export {}\n").unwrap();
        }
        temp
    }

    fn scanner(temp: &TempDir) -> LayoutScanner {
        LayoutScanner::new(
            temp.path(),
            ProjectSettings::default(),
            &["**/node_modules/**".to_string(), "**/*.test.ts".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_missing_source_root_is_no_project() {
        let temp = project(&["package.json"]);
        let err = scanner(&temp).scan().unwrap_err();
        assert!(matches!(err, Error::NoProject { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_scan_discovers_modules_sorted() {
        let temp = project(&[
            "src/index.ts",
            "src/graphql/user.ts",
            "src/graphql/post.tsx",
            "src/styles.css",
            "src/types.d.ts",
            "src/app.test.ts",
            "src/node_modules/dep/index.js",
        ]);

        let layout = scanner(&temp).scan().unwrap();
        let relative: Vec<_> = layout
            .modules
            .iter()
            .map(|p| p.strip_prefix(temp.path()).unwrap().to_path_buf())
            .collect();

        assert_eq!(
            relative,
            vec![
                PathBuf::from("src/graphql/post.tsx"),
                PathBuf::from("src/graphql/user.ts"),
                PathBuf::from("src/index.ts"),
            ]
        );
        assert_eq!(layout.source_root, temp.path().join("src"));
    }

    #[test]
    fn test_entrypoint_detection_order() {
        let temp = project(&["src/server.ts", "src/main.js"]);
        let layout = scanner(&temp).scan().unwrap();
        assert_eq!(layout.entrypoint, Some(temp.path().join("src/main.js")));
    }

    #[test]
    fn test_no_entrypoint_candidate() {
        let temp = project(&["src/graphql/user.ts"]);
        let layout = scanner(&temp).scan().unwrap();
        assert_eq!(layout.entrypoint, None);
    }

    #[test]
    fn test_configured_entrypoint() {
        let temp = project(&["src/index.ts", "src/boot/start.ts"]);
        let settings = ProjectSettings {
            entrypoint: Some(PathBuf::from("boot/start.ts")),
            ..Default::default()
        };
        let layout = LayoutScanner::new(temp.path(), settings, &[])
            .unwrap()
            .scan()
            .unwrap();
        assert_eq!(layout.entrypoint, Some(temp.path().join("src/boot/start.ts")));
    }

    #[test]
    fn test_missing_configured_entrypoint_is_config_error() {
        let temp = project(&["src/index.ts"]);
        let settings = ProjectSettings {
            entrypoint: Some(PathBuf::from("missing.ts")),
            ..Default::default()
        };
        let err = LayoutScanner::new(temp.path(), settings, &[])
            .unwrap()
            .scan()
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_invalid_ignore_glob() {
        let err = LayoutScanner::new("/tmp", ProjectSettings::default(), &["[".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }
}
