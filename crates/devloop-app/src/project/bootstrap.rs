//! Bootstrap script rendering
//!
//! The bootstrap script is the program the runtime actually executes. It
//! reads the launch document, opens the IPC channel, installs error hooks,
//! imports plugin runtime modules and the project's modules, and in a
//! reflection stage reports the stage result and exits.
//!
//! Rendering is pure ([`render_script`]); [`BootstrapRenderer`] materializes
//! the result with an atomic rename so a child never reads a half-written file.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;

use devloop_core::prelude::*;
use devloop_core::{BootstrapScript, Layout, PluginManifest, LAUNCH_ARG};

const DATA_PLACEHOLDER: &str = "__DEVLOOP_DATA__";
const LAUNCH_ARG_PLACEHOLDER: &str = "__DEVLOOP_LAUNCH_ARG__";

const TEMPLATE: &str = r#"// Generated by devloop. Do not edit.
import { createConnection } from "node:net";
import { readFileSync } from "node:fs";
import { pathToFileURL } from "node:url";

const DATA = __DEVLOOP_DATA__;
const LAUNCH_ARG = "__DEVLOOP_LAUNCH_ARG__";

function readLaunchConfig() {
  const index = process.argv.indexOf(LAUNCH_ARG);
  if (index === -1) return { devMode: false };
  const value = process.argv[index + 1];
  const raw = value === "-" ? readFileSync(0, "utf8").split("\n")[0] : value;
  return JSON.parse(raw);
}

const launch = readLaunchConfig();
const stage = launch.stage ?? null;
const socket = launch.ipcSocket ? createConnection(launch.ipcSocket) : null;
socket?.on("error", () => {});
socket?.unref();

function send(message) {
  const line = JSON.stringify(message) + "\n";
  if (socket) socket.write(line);
  else if (stage) process.stdout.write(line);
}

function serializeError(error) {
  if (error instanceof Error) {
    return { name: error.name, message: error.message, stack: error.stack ?? "" };
  }
  return { name: "Error", message: String(error), stack: "" };
}

function exitAfterFlush(code) {
  if (socket) socket.end(() => process.exit(code));
  else process.stdout.write("", () => process.exit(code));
}

function reflectionError(error) {
  const kind = error?.name === "TSError" ? "ts-error" : "runtime-error";
  send({ type: "reflection_error", kind, serializedError: serializeError(error) });
  exitAfterFlush(1);
}

function report(type, event, error) {
  if (stage) return reflectionError(error);
  const willTerminate = process.listenerCount(event) <= 1;
  const { message, stack } = serializeError(error);
  send({ type, error: message, stack, willTerminate });
  if (willTerminate) exitAfterFlush(1);
}

process.on("uncaughtException", (error) =>
  report("uncaught_error", "uncaughtException", error));
process.on("unhandledRejection", (reason) =>
  report("unhandled_rejection", "unhandledRejection", reason));

const registry = { plugins: [], typegen: [] };
globalThis.__devloop = {
  stage,
  devMode: Boolean(launch.devMode),
  layout: launch.layout ?? null,
  registerPlugin(manifest) { registry.plugins.push(manifest); },
  onTypegen(callback) { registry.typegen.push(callback); },
  serverReady() { if (launch.devMode) send({ type: "server_ready" }); },
};

async function load(file) {
  await import(pathToFileURL(file).href);
  if (launch.devMode) send({ type: "module_imported", filePath: file });
}

async function main() {
  if (!stage) {
    for (const plugin of DATA.plugins) {
      const mod = await import(pathToFileURL(plugin.module).href);
      const init = mod[plugin.export];
      if (typeof init === "function") await init(globalThis.__devloop);
      if (launch.devMode) send({ type: "module_imported", filePath: plugin.module });
    }
  }
  for (const file of DATA.modules) {
    if (file !== DATA.entrypoint) await load(file);
  }
  if (DATA.entrypoint) await load(DATA.entrypoint);

  if (stage === "plugin") {
    send({ type: "reflection_success_plugin", plugins: registry.plugins });
    exitAfterFlush(0);
  } else if (stage === "typegen") {
    for (const callback of registry.typegen) await callback(launch.layout);
    send({ type: "reflection_success_typegen" });
    exitAfterFlush(0);
  }
}

main().catch((error) => {
  if (stage) reflectionError(error);
  else report("uncaught_error", "uncaughtException", error);
});
"#;

/// The data section embedded in the script
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapData {
    pub entrypoint: Option<PathBuf>,
    pub modules: Vec<PathBuf>,
    /// Plugins with a runtime export, in discovery order
    pub plugins: Vec<PluginEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginEntry {
    pub name: String,
    pub module: PathBuf,
    pub export: String,
}

pub fn render_data(layout: &Layout, plugins: &[PluginManifest]) -> BootstrapData {
    BootstrapData {
        entrypoint: layout.entrypoint.clone(),
        modules: layout.modules.clone(),
        plugins: plugins
            .iter()
            .filter_map(|plugin| {
                plugin.runtime.as_ref().map(|runtime| PluginEntry {
                    name: plugin.name.clone(),
                    module: runtime.module.clone(),
                    export: runtime.export.clone(),
                })
            })
            .collect(),
    }
}

/// Render the full script text
pub fn render_script(layout: &Layout, plugins: &[PluginManifest]) -> Result<String> {
    let data = serde_json::to_string_pretty(&render_data(layout, plugins))?;
    Ok(TEMPLATE
        .replace(DATA_PLACEHOLDER, &data)
        .replace(LAUNCH_ARG_PLACEHOLDER, LAUNCH_ARG))
}

fn fingerprint(contents: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    contents.hash(&mut hasher);
    hasher.finish()
}

/// Writes bootstrap scripts into one directory
#[derive(Debug, Clone)]
pub struct BootstrapRenderer {
    output_dir: PathBuf,
    file_name: String,
}

impl BootstrapRenderer {
    pub fn new(output_dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            file_name: file_name.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }

    /// Render and materialize. An identical file on disk is left alone.
    pub fn render(&self, layout: &Layout, plugins: &[PluginManifest]) -> Result<BootstrapScript> {
        let contents = render_script(layout, plugins)?;
        let fingerprint = fingerprint(&contents);
        let path = self.path();

        if std::fs::read_to_string(&path).is_ok_and(|existing| existing == contents) {
            trace!("Bootstrap {} unchanged", path.display());
            return Ok(BootstrapScript::new(path).with_fingerprint(fingerprint));
        }

        std::fs::create_dir_all(&self.output_dir)?;
        let mut file = tempfile::NamedTempFile::new_in(&self.output_dir)?;
        file.write_all(contents.as_bytes())?;
        file.persist(&path).map_err(|e| Error::Io(e.error))?;

        debug!(
            "Wrote bootstrap {} ({} plugin(s), fingerprint {:016x})",
            path.display(),
            plugins.len(),
            fingerprint
        );
        Ok(BootstrapScript::new(path).with_fingerprint(fingerprint))
    }
}
