//! Project discovery and bootstrap generation
//!
//! [`Project`] is the controller's view of the user's project: scan the
//! layout, render a bootstrap script for it. [`FsProject`] does both against
//! the real file system.

pub mod bootstrap;
pub mod layout;

use std::path::{Path, PathBuf};

use devloop_core::prelude::*;
use devloop_core::{BootstrapScript, Layout, PluginManifest};

use crate::config::{devloop_dir, Settings};

pub use bootstrap::{render_data, render_script, BootstrapData, BootstrapRenderer, PluginEntry};
pub use layout::{LayoutScanner, ENTRYPOINT_CANDIDATES};

#[cfg_attr(test, mockall::automock)]
pub trait Project: Send + Sync {
    fn root(&self) -> PathBuf;

    fn scan(&self) -> Result<Layout>;

    fn render_bootstrap(&self, layout: &Layout, plugins: &[PluginManifest])
        -> Result<BootstrapScript>;
}

/// Project backed by the file system and `.devloop/config.toml`
#[derive(Debug, Clone)]
pub struct FsProject {
    root: PathBuf,
    scanner: LayoutScanner,
    renderer: BootstrapRenderer,
}

impl FsProject {
    pub fn new(root: impl Into<PathBuf>, settings: &Settings) -> Result<Self> {
        let root = root.into();
        let mut ignore = settings.watcher.ignore_file_patterns.clone();
        ignore.extend(settings.app.ignore_file_patterns.iter().cloned());

        let scanner = LayoutScanner::new(&root, settings.project.clone(), &ignore)?;
        let renderer = BootstrapRenderer::new(devloop_dir(&root), &settings.bootstrap.file_name);
        Ok(Self {
            root,
            scanner,
            renderer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl Project for FsProject {
    fn root(&self) -> PathBuf {
        self.root.clone()
    }

    fn scan(&self) -> Result<Layout> {
        self.scanner.scan()
    }

    fn render_bootstrap(
        &self,
        layout: &Layout,
        plugins: &[PluginManifest],
    ) -> Result<BootstrapScript> {
        self.renderer.render(layout, plugins)
    }
}
