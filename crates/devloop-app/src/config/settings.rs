//! Settings parser for .devloop/config.toml

use std::path::{Path, PathBuf};

use devloop_core::prelude::*;

use super::types::Settings;

const CONFIG_FILENAME: &str = "config.toml";

/// Per-project state directory (config, bootstrap script, session lock)
pub const DEVLOOP_DIR: &str = ".devloop";

pub fn devloop_dir(project_path: &Path) -> PathBuf {
    project_path.join(DEVLOOP_DIR)
}

/// Load settings from .devloop/config.toml
///
/// Returns default settings if file doesn't exist or can't be parsed.
pub fn load_settings(project_path: &Path) -> Settings {
    let config_path = devloop_dir(project_path).join(CONFIG_FILENAME);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Create a commented default config in .devloop/
///
/// Returns the config path. An existing file is left untouched.
pub fn init_config_dir(project_path: &Path) -> Result<PathBuf> {
    let dir = devloop_dir(project_path);

    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::config(format!("Failed to create .devloop dir: {}", e)))?;
    }

    let config_path = dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        let default_content = r#"# devloop configuration

[runtime]
program = "node"        # Resolved on PATH unless absolute
args = []               # e.g. ["--import", "tsx"]

[project]
source_root = "src"
# entrypoint = "index.ts"   # Relative to source_root; detected when unset
extensions = ["ts", "tsx", "mts", "cts", "js", "mjs", "cjs"]

[watcher]
watch_file_patterns = ["src/**", "package.json", "tsconfig.json"]
ignore_file_patterns = ["**/node_modules/**", "**/.git/**", ".devloop/**", "**/*.log"]
debounce_ms = 100

[app]
# allow_file_patterns = []  # Overrides the shared ignore list for restarts
ignore_file_patterns = []

[supervisor]
kill_grace_ms = 5000    # SIGTERM -> SIGKILL

[supervisor.env]
# NODE_ENV = "development"

[reflection]
typegen = true          # Regenerate type artifacts after each restart
timeout_ms = 0          # 0 = no limit
exit_grace_ms = 2000

[bootstrap]
file_name = "bootstrap.mjs"
"#;
        std::fs::write(&config_path, default_content)
            .map_err(|e| Error::config(format!("Failed to write config.toml: {}", e)))?;
        info!("Created {}", config_path.display());
    }

    Ok(config_path)
}
