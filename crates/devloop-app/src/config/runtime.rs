//! Runtime program resolution
//!
//! Bare program names are looked up in the project's `node_modules/.bin`
//! first and then on `PATH`, so a project-local runtime wins over a global one.

use std::path::{Path, PathBuf};

use devloop_core::prelude::*;
use devloop_daemon::RuntimeCommand;

/// Resolve `runtime.program` to an absolute path
pub fn resolve_runtime(runtime: &RuntimeCommand, project_root: &Path) -> Result<RuntimeCommand> {
    let program = resolve_program(&runtime.program, project_root)?;
    debug!("Runtime resolved to {}", program.display());
    Ok(RuntimeCommand {
        program,
        args: runtime.args.clone(),
    })
}

fn resolve_program(program: &Path, project_root: &Path) -> Result<PathBuf> {
    let not_found = || Error::RuntimeNotFound {
        program: program.display().to_string(),
    };

    // Anything with a separator is a path, not a name to search for
    if program.components().count() > 1 || program.is_absolute() {
        let candidate = if program.is_absolute() {
            program.to_path_buf()
        } else {
            project_root.join(program)
        };
        return if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(not_found())
        };
    }

    let local_bin = project_root.join("node_modules").join(".bin");
    if local_bin.is_dir() {
        if let Ok(found) = which::which_in(program, Some(&local_bin), project_root) {
            return Ok(found);
        }
    }

    which::which(program).map_err(|e| {
        debug!("which({}) failed: {}", program.display(), e);
        not_found()
    })
}
