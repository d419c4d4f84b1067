//! Pseudo-terminal helpers for the app child
//!
//! The app runs attached to a pty so it keeps colors and cursor control. The
//! pty is sized from the controlling terminal at spawn time and resized when
//! the terminal changes.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{MasterPty, PtySize};

use devloop_core::prelude::*;

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Rows and columns of a terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Size of the controlling terminal, or 24x80 when there is none (CI, pipes)
pub fn current_terminal_size() -> TerminalSize {
    match crossterm::terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => TerminalSize { rows, cols },
        Ok(_) => TerminalSize::default(),
        Err(e) => {
            trace!("No controlling terminal ({}), using default pty size", e);
            TerminalSize::default()
        }
    }
}

/// Shared handle to the master side of a child's pty
#[derive(Clone)]
pub struct PtyHandle {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
}

impl PtyHandle {
    pub fn new(master: Box<dyn MasterPty + Send>) -> Self {
        Self {
            master: Arc::new(Mutex::new(master)),
        }
    }

    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| Error::terminal("pty lock poisoned"))?;
        master
            .resize(size.into())
            .map_err(|e| Error::terminal(format!("failed to resize pty: {}", e)))
    }

    pub fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>> {
        let master = self
            .master
            .lock()
            .map_err(|_| Error::terminal("pty lock poisoned"))?;
        master
            .try_clone_reader()
            .map_err(|e| Error::terminal(format!("failed to read from pty: {}", e)))
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle").finish_non_exhaustive()
    }
}

/// Copy pty output to our stdout until the child side closes.
///
/// Blocking; run on a blocking thread. Flushes after every read so prompts
/// and progress bars without a trailing newline still show up.
pub fn pump_output(mut reader: Box<dyn Read + Send>, mut out: impl Write) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if out.write_all(&buf[..n]).and_then(|_| out.flush()).is_err() {
                    debug!("stdout closed, stopping pty output pump");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once the slave side is gone
            Err(e) => {
                trace!("pty reader finished: {}", e);
                break;
            }
        }
    }
}
