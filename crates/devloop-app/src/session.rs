//! Per-project session lock
//!
//! Two devloop sessions on one project would fight over the bootstrap script
//! and the app's ports. The first session holds an exclusive lock on
//! `.devloop/session.lock` for its lifetime.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use devloop_core::prelude::*;

use crate::config::devloop_dir;

const LOCK_FILENAME: &str = "session.lock";

/// Held for the lifetime of a session; the lock is released on drop
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    file: File,
}

impl SessionLock {
    /// Take the project's session lock without blocking
    pub fn acquire(project_path: &Path) -> Result<Self> {
        let dir = devloop_dir(project_path);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::config(format!("Failed to create .devloop dir: {}", e)))?;

        let path = dir.join(LOCK_FILENAME);
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::config(format!("Failed to open session.lock: {}", e)))?;

        if file.try_lock_exclusive().is_err() {
            return Err(Error::SessionLocked { path });
        }

        // Owner info for humans; the lock itself is what matters
        file.set_len(0)?;
        writeln!(
            file,
            "pid={} started={}",
            std::process::id(),
            chrono::Local::now().to_rfc3339()
        )?;
        file.flush()?;

        debug!("Acquired session lock {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        trace!("Released session lock {}", self.path.display());
    }
}
