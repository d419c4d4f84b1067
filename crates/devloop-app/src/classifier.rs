//! Change classifier
//!
//! Maps one [`WatchEvent`] to what should happen because of it: nothing, a
//! full restart of the app, and/or notifications to individual plugins. The
//! outcomes are independent; one event may restart the app and notify several
//! plugins at once.
//!
//! Patterns are matched against project-relative paths with `/` separators.
//! `*` crosses directory boundaries.

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};

use devloop_core::prelude::*;
use devloop_core::{PluginManifest, WatchEvent, WatchEventKind};

use crate::config::Settings;

/// Glob lists for one consumer (the app, or one plugin)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerPatterns {
    /// When set: for the app, overrides the shared ignore list; for a plugin,
    /// only matching files are delivered at all
    pub allow_file_patterns: Option<Vec<String>>,
    pub ignore_file_patterns: Vec<String>,
}

/// Uncompiled watch rules, as read from config and plugin manifests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchRulesConfig {
    pub watch_file_patterns: Vec<String>,
    pub ignore_file_patterns: Vec<String>,
    pub app: ConsumerPatterns,
    pub plugins: Vec<(String, ConsumerPatterns)>,
}

impl WatchRulesConfig {
    /// Shared and app rules from `[watcher]` and `[app]`
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            watch_file_patterns: settings.watcher.watch_file_patterns.clone(),
            ignore_file_patterns: settings.watcher.ignore_file_patterns.clone(),
            app: ConsumerPatterns {
                allow_file_patterns: settings.app.allow_file_patterns.clone(),
                ignore_file_patterns: settings.app.ignore_file_patterns.clone(),
            },
            plugins: Vec::new(),
        }
    }

    /// Add the watch contribution of every plugin manifest that declares one
    pub fn with_plugins(mut self, manifests: &[PluginManifest]) -> Self {
        for manifest in manifests {
            let Some(worktime) = &manifest.worktime else {
                continue;
            };
            for pattern in &worktime.watch_file_patterns {
                if !self.watch_file_patterns.contains(pattern) {
                    self.watch_file_patterns.push(pattern.clone());
                }
            }
            self.plugins.push((
                manifest.name.clone(),
                ConsumerPatterns {
                    allow_file_patterns: worktime.allow_file_patterns.clone(),
                    ignore_file_patterns: worktime.ignore_file_patterns.clone(),
                },
            ));
        }
        self
    }

    /// Compile every pattern list. Rules are rebuilt wholesale, never patched.
    pub fn compile(&self) -> Result<WatchRules> {
        Ok(WatchRules {
            watch: compile_set(&self.watch_file_patterns)?,
            watch_patterns: self.watch_file_patterns.clone(),
            shared_ignore: compile_set(&self.ignore_file_patterns)?,
            app: ConsumerRules::compile(&self.app)?,
            plugins: self
                .plugins
                .iter()
                .map(|(name, patterns)| Ok((name.clone(), ConsumerRules::compile(patterns)?)))
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

#[derive(Debug, Clone)]
struct ConsumerRules {
    allow: Option<GlobSet>,
    ignore: GlobSet,
}

impl ConsumerRules {
    fn compile(patterns: &ConsumerPatterns) -> Result<Self> {
        Ok(Self {
            allow: patterns
                .allow_file_patterns
                .as_deref()
                .map(compile_set)
                .transpose()?,
            ignore: compile_set(&patterns.ignore_file_patterns)?,
        })
    }

    fn allows(&self, path: &str) -> bool {
        self.allow.as_ref().is_some_and(|allow| allow.is_match(path))
    }
}

/// Compiled watch rules for one session
#[derive(Debug, Clone)]
pub struct WatchRules {
    watch: GlobSet,
    watch_patterns: Vec<String>,
    shared_ignore: GlobSet,
    app: ConsumerRules,
    plugins: Vec<(String, ConsumerRules)>,
}

impl WatchRules {
    /// Whether a project-relative path is covered by the watch patterns
    pub fn is_watched(&self, path: &str) -> bool {
        self.watch.is_match(path)
    }

    pub fn watch_patterns(&self) -> &[String] {
        &self.watch_patterns
    }

    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|(name, _)| name.as_str())
    }
}

/// What one event means
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// The app must be rescanned and restarted
    pub restart: bool,
    /// Plugins whose file-watch hook gets the event
    pub plugins: Vec<String>,
}

impl Classification {
    pub fn is_ignored(&self) -> bool {
        !self.restart && self.plugins.is_empty()
    }
}

pub fn classify(event: &WatchEvent, rules: &WatchRules) -> Classification {
    let path = event.match_path();
    let shared_ignored = rules.shared_ignore.is_match(&path);

    let restart = event.kind != WatchEventKind::Init
        && !(shared_ignored && !rules.app.allows(&path))
        && !rules.app.ignore.is_match(&path);

    let plugins = rules
        .plugins
        .iter()
        .filter(|(_, consumer)| {
            let eligible = match &consumer.allow {
                Some(allow) => allow.is_match(&path),
                None => !shared_ignored,
            };
            eligible && !consumer.ignore.is_match(&path)
        })
        .map(|(name, _)| name.clone())
        .collect();

    let classification = Classification { restart, plugins };
    trace!("{} -> {:?}", event, classification);
    classification
}

fn compile_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(compile_glob(pattern)?);
    }
    builder
        .build()
        .map_err(|e| Error::config_invalid(format!("invalid glob set: {}", e)))
}

fn compile_glob(pattern: &str) -> Result<Glob> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .build()
        .map_err(|e| Error::config_invalid(format!("invalid glob '{}': {}", pattern, e)))
}
