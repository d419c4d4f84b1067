//! File watcher
//!
//! Watches the static roots of the configured glob patterns with a debounced
//! `notify` watcher and delivers translated [`WatchEvent`] batches as
//! [`DevEvent::FilesChanged`]. An initial scan reports every existing match as
//! an `init` event before live events start flowing.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tokio::sync::mpsc;

use devloop_core::prelude::*;
use devloop_core::{WatchEvent, WatchEventKind};

use crate::classifier::WatchRules;
use crate::message::DevEvent;

/// Default debounce duration in milliseconds
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Configuration for the file watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        }
    }
}

impl WatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// The watcher seam used by the controller
pub trait PathWatcher: Send {
    /// Start watching the roots of `rules`' watch patterns
    fn start(&mut self, rules: WatchRules, tx: mpsc::Sender<DevEvent>) -> Result<()>;

    /// Watch one extra file (absolute) outside the pattern roots
    fn add_path(&mut self, path: PathBuf) -> Result<()>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// A directory the watcher registers, relative to the project root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRoot {
    pub path: PathBuf,
    pub recursive: bool,
}

#[derive(Debug)]
enum Control {
    Add(PathBuf),
    Stop,
}

/// Debounced `notify` watcher for one project
pub struct FileWatcher {
    project_root: PathBuf,
    config: WatcherConfig,
    control_tx: Option<std_mpsc::Sender<Control>>,
}

impl FileWatcher {
    pub fn new(project_root: PathBuf, config: WatcherConfig) -> Self {
        Self {
            project_root,
            config,
            control_tx: None,
        }
    }

    fn run_watcher(
        project_root: PathBuf,
        config: WatcherConfig,
        rules: WatchRules,
        message_tx: mpsc::Sender<DevEvent>,
        control_rx: std_mpsc::Receiver<Control>,
    ) {
        let root = dunce::canonicalize(&project_root).unwrap_or(project_root);
        let filter = Arc::new(EventFilter {
            root: root.clone(),
            rules,
            extra: Mutex::new(HashSet::new()),
        });

        let tx_clone = message_tx.clone();
        let callback_filter = Arc::clone(&filter);
        let debouncer_result = new_debouncer(
            config.debounce,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let batch: Vec<WatchEvent> = events
                        .iter()
                        .flat_map(|event| translate_event(&event.kind, &event.paths))
                        .filter_map(|(kind, path)| callback_filter.accept(kind, path))
                        .collect();

                    if batch.is_empty() {
                        return;
                    }

                    debug!("File watcher detected {} change(s)", batch.len());
                    let _ = tx_clone.blocking_send(DevEvent::FilesChanged(batch));
                }
                Err(errors) => {
                    for error in errors {
                        warn!("File watcher error: {:?}", error);
                        let _ = tx_clone.blocking_send(DevEvent::WatcherError(error.to_string()));
                    }
                }
            },
        );

        let mut debouncer = match debouncer_result {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create file watcher: {}", e);
                let _ = message_tx.blocking_send(DevEvent::WatcherError(format!(
                    "Failed to create watcher: {}",
                    e
                )));
                return;
            }
        };

        let roots = watch_roots(filter.rules.watch_patterns());
        let mut watched = Vec::new();
        for watch_root in &roots {
            let full_path = root.join(&watch_root.path);
            if !full_path.exists() {
                warn!("Watch path does not exist: {}", full_path.display());
                continue;
            }
            let mode = if watch_root.recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            match debouncer.watch(&full_path, mode) {
                Ok(()) => {
                    info!("Watching: {}", full_path.display());
                    watched.push((full_path, watch_root.recursive));
                }
                Err(e) => warn!("Failed to watch {}: {}", full_path.display(), e),
            }
        }

        let initial = initial_scan(&watched, &filter);
        if !initial.is_empty() {
            debug!("Initial scan found {} path(s)", initial.len());
            let _ = message_tx.blocking_send(DevEvent::FilesChanged(initial));
        }

        loop {
            match control_rx.recv() {
                Ok(Control::Add(path)) => {
                    if let Err(e) = debouncer.watch(&path, RecursiveMode::NonRecursive) {
                        warn!("Failed to watch {}: {}", path.display(), e);
                        continue;
                    }
                    debug!("Watching imported module: {}", path.display());
                    filter.add_extra(path);
                }
                Ok(Control::Stop) | Err(_) => {
                    info!("File watcher stopping");
                    break;
                }
            }
        }
    }
}

impl PathWatcher for FileWatcher {
    fn start(&mut self, rules: WatchRules, tx: mpsc::Sender<DevEvent>) -> Result<()> {
        if self.is_running() {
            return Err(Error::watcher("Watcher is already running"));
        }

        let project_root = self.project_root.clone();
        let config = self.config.clone();
        let (control_tx, control_rx) = std_mpsc::channel();
        self.control_tx = Some(control_tx);

        tokio::task::spawn_blocking(move || {
            Self::run_watcher(project_root, config, rules, tx, control_rx);
        });

        Ok(())
    }

    fn add_path(&mut self, path: PathBuf) -> Result<()> {
        let Some(control_tx) = &self.control_tx else {
            return Err(Error::watcher("Watcher is not running"));
        };
        control_tx
            .send(Control::Add(path))
            .map_err(|_| Error::watcher("Watcher thread has exited"))
    }

    fn stop(&mut self) {
        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(Control::Stop);
        }
    }

    fn is_running(&self) -> bool {
        self.control_tx.is_some()
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decides which raw paths become [`WatchEvent`]s
struct EventFilter {
    root: PathBuf,
    rules: WatchRules,
    /// Absolute files added after start
    extra: Mutex<HashSet<PathBuf>>,
}

impl EventFilter {
    fn add_extra(&self, path: PathBuf) {
        self.extra
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path);
    }

    fn is_extra(&self, path: &Path) -> bool {
        self.extra
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(path)
    }

    fn accept(&self, kind: WatchEventKind, path: PathBuf) -> Option<WatchEvent> {
        let extra = self.is_extra(&path);
        match path.strip_prefix(&self.root) {
            Ok(relative) if relative.as_os_str().is_empty() => None,
            Ok(relative) => {
                let event = WatchEvent::new(kind, relative);
                (extra || self.rules.is_watched(&event.match_path())).then_some(event)
            }
            Err(_) => extra.then(|| WatchEvent::new(kind, path)),
        }
    }
}

/// Walk the watched roots and report every matching entry as `init`
fn initial_scan(watched: &[(PathBuf, bool)], filter: &EventFilter) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    for (path, recursive) in watched {
        if path.is_file() {
            events.extend(filter.accept(WatchEventKind::Init, path.clone()));
            continue;
        }

        let mut walker = ignore::WalkBuilder::new(path);
        walker.standard_filters(false);
        if !recursive {
            walker.max_depth(Some(1));
        }

        for entry in walker.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    trace!("Initial scan skipped an entry: {}", e);
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            events.extend(filter.accept(WatchEventKind::Init, entry.into_path()));
        }
    }
    events
}

/// Translate one `notify` event into watch events.
///
/// Metadata-only and access events produce nothing.
pub fn translate_event(kind: &EventKind, paths: &[PathBuf]) -> Vec<(WatchEventKind, PathBuf)> {
    let added = |path: &PathBuf| {
        let kind = if path.is_dir() {
            WatchEventKind::AddDir
        } else {
            WatchEventKind::Add
        };
        (kind, path.clone())
    };

    match kind {
        EventKind::Create(CreateKind::Folder) => paths
            .iter()
            .map(|p| (WatchEventKind::AddDir, p.clone()))
            .collect(),
        EventKind::Create(_) => paths.iter().map(added).collect(),

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
            .iter()
            .map(|p| (WatchEventKind::Unlink, p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths.iter().map(added).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths {
            [from, to, ..] => vec![(WatchEventKind::Unlink, from.clone()), added(to)],
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|p| {
                if p.exists() {
                    added(p)
                } else {
                    (WatchEventKind::Unlink, p.clone())
                }
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => paths
            .iter()
            .filter(|p| !p.is_dir())
            .map(|p| (WatchEventKind::Change, p.clone()))
            .collect(),

        EventKind::Remove(RemoveKind::Folder) => paths
            .iter()
            .map(|p| (WatchEventKind::UnlinkDir, p.clone()))
            .collect(),
        EventKind::Remove(_) => paths
            .iter()
            .map(|p| (WatchEventKind::Unlink, p.clone()))
            .collect(),

        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Directories to register for a set of glob patterns.
///
/// A pattern is watched from its longest literal prefix. A pattern with no
/// glob characters names one file, whose parent is watched non-recursively.
/// Roots already covered by a recursive ancestor are dropped.
pub fn watch_roots(patterns: &[String]) -> Vec<WatchRoot> {
    let mut roots: Vec<WatchRoot> = patterns.iter().map(|p| root_of(p)).collect();
    roots.sort_by(|a, b| {
        a.path
            .components()
            .count()
            .cmp(&b.path.components().count())
            .then(b.recursive.cmp(&a.recursive))
            .then(a.path.cmp(&b.path))
    });

    let mut kept: Vec<WatchRoot> = Vec::new();
    for root in roots {
        let covered = kept.iter().any(|k| {
            (k.recursive && root.path.starts_with(&k.path))
                || (k.path == root.path && !root.recursive)
        });
        if !covered {
            kept.push(root);
        }
    }
    kept
}

fn root_of(pattern: &str) -> WatchRoot {
    let mut prefix = PathBuf::new();
    for component in Path::new(pattern).components() {
        let Component::Normal(part) = component else {
            continue;
        };
        if has_glob_meta(&part.to_string_lossy()) {
            return WatchRoot {
                path: prefix,
                recursive: true,
            };
        }
        prefix.push(part);
    }

    WatchRoot {
        path: prefix.parent().map(Path::to_path_buf).unwrap_or_default(),
        recursive: false,
    }
}

fn has_glob_meta(part: &str) -> bool {
    part.contains(['*', '?', '[', '{'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::WatchRulesConfig;

    fn patterns(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn root(path: &str, recursive: bool) -> WatchRoot {
        WatchRoot {
            path: PathBuf::from(path),
            recursive,
        }
    }

    #[test]
    fn test_watcher_config_default() {
        let config = WatcherConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(DEFAULT_DEBOUNCE_MS));
    }

    #[test]
    fn test_watcher_config_builder() {
        let config = WatcherConfig::new().with_debounce(Duration::from_millis(250));
        assert_eq!(config.debounce, Duration::from_millis(250));
    }

    #[test]
    fn test_watch_roots_static_prefix() {
        let roots = watch_roots(&patterns(&["src/**", "schema/**/*.graphql"]));
        assert_eq!(roots, vec![root("schema", true), root("src", true)]);
    }

    #[test]
    fn test_watch_roots_literal_file_watches_parent() {
        let roots = watch_roots(&patterns(&["package.json", "config/app.json"]));
        assert_eq!(roots, vec![root("", false), root("config", false)]);
    }

    #[test]
    fn test_watch_roots_dedupes_nested() {
        let roots = watch_roots(&patterns(&[
            "src/graphql/**",
            "src/**",
            "src/index.ts",
            "package.json",
            "tsconfig.json",
        ]));
        assert_eq!(roots, vec![root("", false), root("src", true)]);
    }

    #[test]
    fn test_watch_roots_top_level_glob_is_recursive_root() {
        let roots = watch_roots(&patterns(&["*.graphql", "package.json"]));
        assert_eq!(roots, vec![root("", true)]);
    }

    #[test]
    fn test_translate_create_and_remove() {
        let file = PathBuf::from("/nonexistent/app.ts");
        let dir = PathBuf::from("/nonexistent/routes");

        assert_eq!(
            translate_event(&EventKind::Create(CreateKind::File), &[file.clone()]),
            vec![(WatchEventKind::Add, file.clone())]
        );
        assert_eq!(
            translate_event(&EventKind::Create(CreateKind::Folder), &[dir.clone()]),
            vec![(WatchEventKind::AddDir, dir.clone())]
        );
        assert_eq!(
            translate_event(&EventKind::Remove(RemoveKind::File), &[file.clone()]),
            vec![(WatchEventKind::Unlink, file)]
        );
        assert_eq!(
            translate_event(&EventKind::Remove(RemoveKind::Folder), &[dir.clone()]),
            vec![(WatchEventKind::UnlinkDir, dir)]
        );
    }

    #[test]
    fn test_translate_rename_both() {
        let from = PathBuf::from("/nonexistent/old.ts");
        let to = PathBuf::from("/nonexistent/new.ts");
        let events = translate_event(
            &EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[from.clone(), to.clone()],
        );

        assert_eq!(
            events,
            vec![(WatchEventKind::Unlink, from), (WatchEventKind::Add, to)]
        );
    }

    #[test]
    fn test_translate_data_change_and_metadata() {
        use notify::event::{DataChange, MetadataKind};

        let file = PathBuf::from("/nonexistent/app.ts");
        assert_eq!(
            translate_event(
                &EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &[file.clone()]
            ),
            vec![(WatchEventKind::Change, file.clone())]
        );
        assert!(translate_event(
            &EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &[file.clone()]
        )
        .is_empty());
        assert!(translate_event(
            &EventKind::Access(notify::event::AccessKind::Any),
            &[file]
        )
        .is_empty());
    }

    #[test]
    fn test_event_filter_relativizes_and_filters() {
        let rules = WatchRulesConfig {
            watch_file_patterns: patterns(&["src/**"]),
            ..Default::default()
        }
        .compile()
        .unwrap();
        let filter = EventFilter {
            root: PathBuf::from("/project"),
            rules,
            extra: Mutex::new(HashSet::new()),
        };

        let accepted = filter
            .accept(WatchEventKind::Change, PathBuf::from("/project/src/app.ts"))
            .unwrap();
        assert_eq!(accepted.path, PathBuf::from("src/app.ts"));

        assert!(filter
            .accept(WatchEventKind::Change, PathBuf::from("/project/README.md"))
            .is_none());
        assert!(filter
            .accept(WatchEventKind::Change, PathBuf::from("/elsewhere/lib.ts"))
            .is_none());

        filter.add_extra(PathBuf::from("/elsewhere/lib.ts"));
        let extra = filter
            .accept(WatchEventKind::Change, PathBuf::from("/elsewhere/lib.ts"))
            .unwrap();
        assert_eq!(extra.path, PathBuf::from("/elsewhere/lib.ts"));
    }

    #[test]
    fn test_file_watcher_creation() {
        let watcher = FileWatcher::new(PathBuf::from("/tmp/test_project"), WatcherConfig::new());
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_add_path_when_not_running_errors() {
        let mut watcher = FileWatcher::new(PathBuf::from("/tmp/test_project"), WatcherConfig::new());
        let err = watcher.add_path(PathBuf::from("/tmp/x.ts")).unwrap_err();
        assert!(matches!(err, Error::Watcher { .. }));
    }

    #[tokio::test]
    async fn test_file_watcher_double_start_error() {
        let temp = tempfile::tempdir().unwrap();
        let rules = WatchRulesConfig::default().compile().unwrap();
        let mut watcher = FileWatcher::new(temp.path().to_path_buf(), WatcherConfig::new());
        let (tx, _rx) = mpsc::channel(32);

        assert!(watcher.start(rules.clone(), tx.clone()).is_ok());
        assert!(watcher.is_running());

        let second = watcher.start(rules, tx);
        assert!(second.is_err());

        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial_test::serial]
    async fn test_file_watcher_reports_init_then_changes() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/app.ts"), "export {}\n").unwrap();
        std::fs::write(temp.path().join("notes.txt"), "ignored\n").unwrap();

        let rules = WatchRulesConfig {
            watch_file_patterns: patterns(&["src/**"]),
            ..Default::default()
        }
        .compile()
        .unwrap();
        let mut watcher = FileWatcher::new(
            temp.path().to_path_buf(),
            WatcherConfig::new().with_debounce(Duration::from_millis(50)),
        );
        let (tx, mut rx) = mpsc::channel(32);
        watcher.start(rules, tx).unwrap();

        let init = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let DevEvent::FilesChanged(init) = init else {
            panic!("expected initial scan, got {:?}", init);
        };
        assert_eq!(
            init,
            vec![WatchEvent::new(WatchEventKind::Init, "src/app.ts")]
        );

        std::fs::write(temp.path().join("src/new.ts"), "export {}\n").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while !seen {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("no watcher event for src/new.ts")
                .unwrap();
            if let DevEvent::FilesChanged(batch) = event {
                seen = batch.iter().any(|e| e.path == Path::new("src/new.ts"));
            }
        }

        watcher.stop();
    }
}
