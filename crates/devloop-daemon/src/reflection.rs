//! Reflection runner
//!
//! Reflection runs the app in a constrained stage inside a short-lived child:
//! `plugin` to discover the plugin set, `typegen` to regenerate type artifacts.
//! The child gets its [`ChildLaunchConfig`] as a JSON line on stdin and reports
//! back with IPC lines on stdout. Exactly one [`ReflectionResult`] is produced
//! per run, whatever the child does.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use devloop_core::prelude::*;
use devloop_core::{
    decode_line, strip_ansi_codes, BootstrapScript, ChildLaunchConfig, Layout, Message,
    PluginManifest, ReflectionErrorKind, ReflectionStage, SerializedError, LAUNCH_ARG,
    LAUNCH_FROM_STDIN,
};

use crate::host::RuntimeCommand;
use crate::process_tree::{self, TreeSignal};

/// Time a resolved child gets to exit on its own before it is killed
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on draining stdout/stderr after the child exits
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What a reflection run is asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionMode {
    /// Discover the plugins the app uses
    UsedPlugins,
    /// Regenerate type artifacts
    Artifacts,
}

impl ReflectionMode {
    pub fn stage(self) -> ReflectionStage {
        match self {
            ReflectionMode::UsedPlugins => ReflectionStage::Plugin,
            ReflectionMode::Artifacts => ReflectionStage::Typegen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectionFailure {
    pub kind: ReflectionErrorKind,
    pub error: SerializedError,
}

impl std::fmt::Display for ReflectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.error, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReflectionResult {
    Plugins(Vec<PluginManifest>),
    Artifacts,
    Failure(ReflectionFailure),
}

impl ReflectionResult {
    /// A runtime-error failure synthesized on the devloop side
    pub fn runner_failure(message: impl Into<String>) -> Self {
        ReflectionResult::Failure(ReflectionFailure {
            kind: ReflectionErrorKind::RuntimeError,
            error: SerializedError::new("Error", message),
        })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ReflectionResult::Failure(_))
    }

    /// Plugins of a successful plugin-stage run, anything else as an error
    pub fn into_plugins(self) -> Result<Vec<PluginManifest>> {
        match self {
            ReflectionResult::Plugins(plugins) => Ok(plugins),
            ReflectionResult::Artifacts => Err(Error::reflection(
                ReflectionStage::Plugin,
                "runner produced type artifacts instead of a plugin list",
            )),
            ReflectionResult::Failure(failure) => Err(Error::reflection(
                ReflectionStage::Plugin,
                failure.to_string(),
            )),
        }
    }
}

/// Output observed from a reflection child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    Stdout(String),
    Stderr(String),
    /// The child exited and both output streams were drained
    Exited(Option<i32>),
}

/// Turns a stream of [`RunnerEvent`]s into exactly one [`ReflectionResult`].
///
/// The first resolving event wins; everything after it is ignored.
#[derive(Debug)]
pub struct ReflectionCollector {
    stage: ReflectionStage,
    resolved: bool,
    last_runtime_error: Option<SerializedError>,
}

impl ReflectionCollector {
    pub fn new(stage: ReflectionStage) -> Self {
        Self {
            stage,
            resolved: false,
            last_runtime_error: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Feed one event. Returns the result the first time the run resolves.
    pub fn feed(&mut self, event: RunnerEvent) -> Option<ReflectionResult> {
        if self.resolved {
            trace!("Reflection already resolved, ignoring {:?}", event);
            return None;
        }

        let result = match event {
            RunnerEvent::Stdout(line) => match decode_line(&line) {
                Some(message) => self.on_message(message)?,
                None => {
                    info!("[{}] {}", self.stage, line);
                    return None;
                }
            },
            RunnerEvent::Stderr(line) => {
                let message = strip_ansi_codes(&line);
                warn!("[{}] stderr: {}", self.stage, message);
                ReflectionResult::runner_failure(message)
            }
            RunnerEvent::Exited(code) => self.on_exit(code),
        };

        self.resolved = true;
        Some(result)
    }

    fn on_message(&mut self, message: Message) -> Option<ReflectionResult> {
        match (self.stage, message) {
            (ReflectionStage::Plugin, Message::ReflectionSuccessPlugin { plugins }) => {
                Some(ReflectionResult::Plugins(plugins))
            }
            (ReflectionStage::Typegen, Message::ReflectionSuccessTypegen) => {
                Some(ReflectionResult::Artifacts)
            }
            (_, Message::ReflectionError {
                kind,
                serialized_error,
            }) => Some(ReflectionResult::Failure(ReflectionFailure {
                kind,
                error: serialized_error,
            })),
            (stage, message @ (Message::ReflectionSuccessPlugin { .. }
            | Message::ReflectionSuccessTypegen)) => {
                Some(ReflectionResult::runner_failure(format!(
                    "Unexpected reflection result for {} stage: {}",
                    stage,
                    message.summary()
                )))
            }
            (_, Message::UncaughtError { error, stack, .. })
            | (_, Message::UnhandledRejection { error, stack, .. }) => {
                warn!("[{}] runtime error: {}", self.stage, error);
                let mut serialized = SerializedError::new("Error", error);
                serialized.stack = stack;
                self.last_runtime_error = Some(serialized);
                None
            }
            (_, Message::ServerReady) | (_, Message::ModuleImported { .. }) => None,
        }
    }

    fn on_exit(&mut self, code: Option<i32>) -> ReflectionResult {
        if let Some(error) = self.last_runtime_error.take() {
            return ReflectionResult::Failure(ReflectionFailure {
                kind: ReflectionErrorKind::RuntimeError,
                error,
            });
        }
        match code {
            Some(0) => ReflectionResult::runner_failure(
                "Runner exited without reporting a reflection result.",
            ),
            Some(code) => {
                ReflectionResult::runner_failure(format!("Runner failed with exit code {}.", code))
            }
            None => ReflectionResult::runner_failure("Runner was terminated by a signal."),
        }
    }
}

/// Runs one reflection against a bootstrap script
#[trait_variant::make(Reflector: Send)]
pub trait LocalReflector {
    async fn reflect(
        &self,
        script: &BootstrapScript,
        layout: &Layout,
        mode: ReflectionMode,
    ) -> ReflectionResult;
}

/// Real reflector: one subprocess per run
#[derive(Debug, Clone)]
pub struct ReflectionRunner {
    runtime: RuntimeCommand,
    cwd: PathBuf,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
    exit_grace: Duration,
}

impl ReflectionRunner {
    pub fn new(runtime: RuntimeCommand, cwd: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            cwd: cwd.into(),
            env: Vec::new(),
            timeout: None,
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    #[instrument(skip_all, fields(stage = %mode.stage()))]
    async fn run(
        &self,
        script: &BootstrapScript,
        layout: &Layout,
        mode: ReflectionMode,
    ) -> ReflectionResult {
        let stage = mode.stage();
        let launch = ChildLaunchConfig::reflection(stage, layout.clone());
        let payload = match launch.to_json() {
            Ok(json) => json,
            Err(e) => return ReflectionResult::runner_failure(e.to_string()),
        };

        debug!("Spawning reflection runner for {}", script.path().display());
        let mut command = Command::new(&self.runtime.program);
        command
            .args(&self.runtime.args)
            .arg(script.path())
            .arg(LAUNCH_ARG)
            .arg(LAUNCH_FROM_STDIN)
            .current_dir(&self.cwd)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so the whole tree can be signalled at once.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ReflectionResult::runner_failure(format!(
                    "Failed to spawn {}: {}",
                    self.runtime.program.display(),
                    e
                ))
            }
        };

        let (tx, mut rx) = mpsc::channel::<RunnerEvent>(64);

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let write = async {
                    stdin.write_all(payload.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.shutdown().await
                };
                if let Err(e) = write.await {
                    debug!("Failed to write launch config to reflection runner: {}", e);
                }
            });
        }

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(stdout, tx.clone(), RunnerEvent::Stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(stderr, tx.clone(), RunnerEvent::Stderr)));
        }

        let (resolved_tx, resolved_rx) = oneshot::channel();
        tokio::spawn(wait_for_exit(child, resolved_rx, self.exit_grace, readers, tx));

        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut collector = ReflectionCollector::new(stage);

        let result = loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        let secs = self.timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
                        break ReflectionResult::runner_failure(format!(
                            "Runner timed out after {:.1}s.",
                            secs
                        ));
                    }
                },
                None => rx.recv().await,
            };

            match next {
                Some(event) => {
                    if let Some(result) = collector.feed(event) {
                        break result;
                    }
                }
                // Every sender is gone without an exit event; the wait task died.
                None => break ReflectionResult::runner_failure("Runner exited unexpectedly."),
            }
        };

        let _ = resolved_tx.send(());

        match &result {
            ReflectionResult::Failure(failure) => warn!("Reflection failed: {}", failure),
            ReflectionResult::Plugins(plugins) => {
                debug!("Reflection discovered {} plugin(s)", plugins.len())
            }
            ReflectionResult::Artifacts => debug!("Reflection generated type artifacts"),
        }
        result
    }
}

impl Reflector for ReflectionRunner {
    async fn reflect(
        &self,
        script: &BootstrapScript,
        layout: &Layout,
        mode: ReflectionMode,
    ) -> ReflectionResult {
        self.run(script, layout, mode).await
    }
}

async fn read_lines<R>(stream: R, tx: mpsc::Sender<RunnerEvent>, wrap: fn(String) -> RunnerEvent)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(wrap(line)).await.is_err() {
            break;
        }
    }
}

/// Owns the reflection child until it is reaped.
///
/// Once the run resolves (or the runner stops listening) the child gets
/// `grace` to exit before it is killed together with its descendants.
/// `Exited` is only sent after the
/// output readers finish, so it never overtakes the child's last lines.
async fn wait_for_exit(
    mut child: Child,
    resolved_rx: oneshot::Receiver<()>,
    grace: Duration,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::Sender<RunnerEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = resolved_rx => match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                debug!("Reflection runner still alive after {:?}, killing", grace);
                if let Some(pid) = child.id() {
                    if let Err(e) = process_tree::signal_tree(pid, TreeSignal::Kill) {
                        warn!("Failed to kill reflection runner tree {}: {}", pid, e);
                    }
                }
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill reflection runner: {}", e);
                }
                child.wait().await
            }
        },
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            error!("Error waiting for reflection runner: {}", e);
            None
        }
    };

    if tokio::time::timeout(READER_DRAIN_TIMEOUT, join_all(readers))
        .await
        .is_err()
    {
        debug!("Reflection output still open after exit (orphaned descendants?)");
    }

    let _ = tx.send(RunnerEvent::Exited(code)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use devloop_core::encode_line;

    fn plugin_success() -> String {
        encode_line(&Message::ReflectionSuccessPlugin {
            plugins: vec![PluginManifest::new("graphql")],
        })
        .unwrap()
        .trim_end()
        .to_string()
    }

    #[test]
    fn test_first_terminal_message_wins() {
        let mut collector = ReflectionCollector::new(ReflectionStage::Plugin);

        let first = collector.feed(RunnerEvent::Stdout(plugin_success()));
        assert_eq!(
            first,
            Some(ReflectionResult::Plugins(vec![PluginManifest::new("graphql")]))
        );

        let error = encode_line(&Message::ReflectionError {
            kind: ReflectionErrorKind::TsError,
            serialized_error: SerializedError::new("TSError", "late"),
        })
        .unwrap();
        assert_eq!(collector.feed(RunnerEvent::Stdout(error)), None);
        assert_eq!(collector.feed(RunnerEvent::Stderr("boom".into())), None);
        assert_eq!(collector.feed(RunnerEvent::Exited(Some(1))), None);
        assert!(collector.is_resolved());
    }

    #[test]
    fn test_plain_stdout_is_not_a_result() {
        let mut collector = ReflectionCollector::new(ReflectionStage::Typegen);
        assert_eq!(collector.feed(RunnerEvent::Stdout("compiling...".into())), None);
        assert_eq!(
            collector.feed(RunnerEvent::Stdout(r#"{"type":"server_ready"}"#.into())),
            None
        );
        assert_eq!(
            collector.feed(RunnerEvent::Stdout(
                r#"{"type":"reflection_success_typegen"}"#.into()
            )),
            Some(ReflectionResult::Artifacts)
        );
    }

    #[test]
    fn test_nonzero_exit_without_message() {
        let mut collector = ReflectionCollector::new(ReflectionStage::Plugin);
        let result = collector.feed(RunnerEvent::Exited(Some(1))).unwrap();
        assert_eq!(
            result,
            ReflectionResult::runner_failure("Runner failed with exit code 1.")
        );
    }

    #[test]
    fn test_zero_exit_without_message_is_failure() {
        let mut collector = ReflectionCollector::new(ReflectionStage::Typegen);
        let result = collector.feed(RunnerEvent::Exited(Some(0))).unwrap();
        assert!(result.is_failure());
    }

    #[test]
    fn test_stderr_is_failure_with_ansi_stripped() {
        let mut collector = ReflectionCollector::new(ReflectionStage::Plugin);
        let result = collector
            .feed(RunnerEvent::Stderr("\x1b[31mTypeError: x is undefined\x1b[0m".into()))
            .unwrap();
        assert_eq!(
            result,
            ReflectionResult::runner_failure("TypeError: x is undefined")
        );
    }

    #[test]
    fn test_wrong_stage_result_is_failure() {
        let mut collector = ReflectionCollector::new(ReflectionStage::Typegen);
        let result = collector.feed(RunnerEvent::Stdout(plugin_success())).unwrap();
        match result {
            ReflectionResult::Failure(failure) => {
                assert!(failure.error.message.contains("typegen"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_uncaught_error_becomes_exit_failure() {
        let mut collector = ReflectionCollector::new(ReflectionStage::Plugin);
        let uncaught = encode_line(&Message::UncaughtError {
            error: "ReferenceError: foo is not defined".into(),
            stack: "at main.ts:1".into(),
            will_terminate: true,
        })
        .unwrap();
        assert_eq!(collector.feed(RunnerEvent::Stdout(uncaught)), None);

        match collector.feed(RunnerEvent::Exited(Some(1))).unwrap() {
            ReflectionResult::Failure(failure) => {
                assert_eq!(failure.kind, ReflectionErrorKind::RuntimeError);
                assert_eq!(failure.error.message, "ReferenceError: foo is not defined");
                assert_eq!(failure.error.stack, "at main.ts:1");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_reflection_error_is_passed_through() {
        let mut collector = ReflectionCollector::new(ReflectionStage::Typegen);
        let line = encode_line(&Message::ReflectionError {
            kind: ReflectionErrorKind::TsError,
            serialized_error: SerializedError::new("TSError", "Type 'string' is not assignable"),
        })
        .unwrap();

        let result = collector.feed(RunnerEvent::Stdout(line)).unwrap();
        assert_eq!(
            result,
            ReflectionResult::Failure(ReflectionFailure {
                kind: ReflectionErrorKind::TsError,
                error: SerializedError::new("TSError", "Type 'string' is not assignable"),
            })
        );
    }

    #[test]
    fn test_into_plugins() {
        let plugins = ReflectionResult::Plugins(vec![PluginManifest::new("a")])
            .into_plugins()
            .unwrap();
        assert_eq!(plugins.len(), 1);

        let err = ReflectionResult::runner_failure("Runner failed with exit code 1.")
            .into_plugins()
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("exit code 1"));
    }

    #[cfg(unix)]
    mod runner {
        use super::*;
        use std::path::Path;

        fn write_script(dir: &Path, body: &str) -> BootstrapScript {
            let path = dir.join("bootstrap.sh");
            std::fs::write(&path, body).unwrap();
            BootstrapScript::new(path)
        }

        fn runner(dir: &Path) -> ReflectionRunner {
            ReflectionRunner::new(RuntimeCommand::new("sh"), dir)
                .with_exit_grace(Duration::from_millis(200))
        }

        #[tokio::test]
        #[serial_test::serial]
        async fn test_exit_one_without_message() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "exit 1\n");
            let layout = Layout::new(dir.path(), dir.path());

            let result = runner(dir.path())
                .run(&script, &layout, ReflectionMode::UsedPlugins)
                .await;

            assert_eq!(
                result,
                ReflectionResult::runner_failure("Runner failed with exit code 1.")
            );
        }

        #[tokio::test]
        #[serial_test::serial]
        async fn test_launch_config_arrives_on_stdin() {
            let dir = tempfile::tempdir().unwrap();
            // Echo back a plugin whose name proves the stage was read from stdin.
            let script = write_script(
                dir.path(),
                r#"read config
case "$config" in
  *'"stage":"plugin"'*) name=from-stdin ;;
  *) name=missing ;;
esac
echo "starting up"
echo "{\"type\":\"reflection_success_plugin\",\"plugins\":[{\"name\":\"$name\"}]}"
"#,
            );
            let layout = Layout::new(dir.path(), dir.path().join("src"));

            let result = runner(dir.path())
                .run(&script, &layout, ReflectionMode::UsedPlugins)
                .await;

            assert_eq!(
                result,
                ReflectionResult::Plugins(vec![PluginManifest::new("from-stdin")])
            );
        }

        #[tokio::test]
        #[serial_test::serial]
        async fn test_lingering_runner_is_killed_after_result() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(
                dir.path(),
                "echo '{\"type\":\"reflection_success_typegen\"}'\nexec sleep 30\n",
            );
            let layout = Layout::new(dir.path(), dir.path());

            let started = std::time::Instant::now();
            let result = runner(dir.path())
                .run(&script, &layout, ReflectionMode::Artifacts)
                .await;

            assert_eq!(result, ReflectionResult::Artifacts);
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        #[serial_test::serial]
        async fn test_lingering_runner_descendants_are_killed() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(
                dir.path(),
                "sleep 30 &\necho $! > child.pid\necho '{\"type\":\"reflection_success_typegen\"}'\nwait\n",
            );
            let layout = Layout::new(dir.path(), dir.path());

            let result = runner(dir.path())
                .run(&script, &layout, ReflectionMode::Artifacts)
                .await;
            assert_eq!(result, ReflectionResult::Artifacts);

            let pid = std::fs::read_to_string(dir.path().join("child.pid")).unwrap();
            let stat = format!("/proc/{}/stat", pid.trim());

            // Gone or a zombie awaiting its reaper both count as dead.
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            let dead = loop {
                let alive = match std::fs::read_to_string(&stat) {
                    Ok(contents) => contents
                        .rsplit(')')
                        .next()
                        .and_then(|rest| rest.split_whitespace().next())
                        .is_some_and(|state| state != "Z"),
                    Err(_) => false,
                };
                if !alive {
                    break true;
                }
                if std::time::Instant::now() > deadline {
                    break false;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            };
            assert!(dead, "descendant {} outlived the reflection runner", pid.trim());
        }

        #[tokio::test]
        #[serial_test::serial]
        async fn test_timeout() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "exec sleep 30\n");
            let layout = Layout::new(dir.path(), dir.path());

            let result = runner(dir.path())
                .with_timeout(Some(Duration::from_millis(200)))
                .run(&script, &layout, ReflectionMode::Artifacts)
                .await;

            assert_eq!(
                result,
                ReflectionResult::runner_failure("Runner timed out after 0.2s.")
            );
        }

        #[tokio::test]
        async fn test_missing_runtime_is_failure() {
            let dir = tempfile::tempdir().unwrap();
            let script = BootstrapScript::new(dir.path().join("bootstrap.mjs"));
            let layout = Layout::new(dir.path(), dir.path());

            let result = ReflectionRunner::new(
                RuntimeCommand::new("devloop-no-such-runtime"),
                dir.path(),
            )
            .run(&script, &layout, ReflectionMode::UsedPlugins)
            .await;

            match result {
                ReflectionResult::Failure(failure) => {
                    assert!(failure.error.message.starts_with("Failed to spawn"));
                }
                other => panic!("expected failure, got {:?}", other),
            }
        }
    }
}
