use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, SegError};
use crate::params::{JobMetadata, JobParameters};
use crate::protocol::{parse_line, JobEvent};
use crate::runner::remove_best_effort;
use crate::sandbox::{executable_dir, EnvironmentBuilder};

/// Runner binary name, looked up next to the current executable.
pub const RUNNER_NAME: &str = "tileseg-runner";

/// Launches jobs in an isolated runner process and relays its protocol.
#[derive(Debug, Clone)]
pub struct Supervisor {
    program: PathBuf,
    args: Vec<OsString>,
    env: EnvironmentBuilder,
}

impl Supervisor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let mut env = EnvironmentBuilder::from_parent();
        if let Some(dir) = executable_dir(&program) {
            env = env.path_dir(dir);
        }
        Self {
            program,
            args: Vec::new(),
            env,
        }
    }

    /// `tileseg-runner` in the directory of the running executable.
    pub fn locate_runner() -> Result<PathBuf> {
        let exe = std::env::current_exe().map_err(|e| SegError::FileSystem {
            path: PathBuf::from(RUNNER_NAME),
            operation: "locate current executable".to_string(),
            source: e,
        })?;
        let dir = executable_dir(&exe).unwrap_or_default();
        let runner = dir.join(format!("{RUNNER_NAME}{}", std::env::consts::EXE_SUFFIX));
        if !runner.is_file() {
            return Err(SegError::Configuration {
                message: format!("runner not found at {}", runner.display()),
            });
        }
        Ok(runner)
    }

    /// Arguments placed before the parameter file path.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: EnvironmentBuilder) -> Self {
        self.env = env;
        self
    }

    /// Runs one job and returns the metadata sidecar path.
    ///
    /// `on_event` sees `Progress(10)` once the runner is spawned, then every
    /// protocol event in order, and `Progress(0)` if the job fails.
    pub async fn run<F>(
        &self,
        params: &JobParameters,
        mut on_event: F,
        cancel: CancellationToken,
    ) -> Result<PathBuf>
    where
        F: FnMut(JobEvent),
    {
        params.validate()?;

        let params_file = tempfile::Builder::new()
            .prefix("tileseg_params_")
            .suffix(".json")
            .tempfile()
            .map_err(|e| SegError::FileSystem {
                path: std::env::temp_dir(),
                operation: "create parameter file".to_string(),
                source: e,
            })?
            .into_temp_path();

        let result = match params.write_to(&params_file) {
            Ok(()) => self.execute(&params_file, &mut on_event, &cancel).await,
            Err(e) => Err(e),
        };

        let shown = params_file.to_path_buf();
        if let Err(e) = params_file.close() {
            warn!(path = %shown.display(), error = %e, "could not remove parameter file");
        }

        if result.is_err() {
            on_event(JobEvent::Progress(0));
        }
        result
    }

    async fn execute<F>(
        &self,
        params_file: &Path,
        on_event: &mut F,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>
    where
        F: FnMut(JobEvent),
    {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(params_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.env.apply(&mut command)?;

        let mut child = command.spawn().map_err(|e| SegError::FileSystem {
            path: self.program.clone(),
            operation: "spawn runner".to_string(),
            source: e,
        })?;
        info!(runner = %self.program.display(), pid = child.id(), "runner started");
        on_event(JobEvent::Progress(10));

        let stdout = child.stdout.take().ok_or_else(|| pipe_missing("stdout"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| pipe_missing("stderr"))?;
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            stderr.read_to_string(&mut text).await.map(|_| text)
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut result = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(kill(&mut child).await),
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match parse_line(&line) {
                        Some(event) => {
                            if let JobEvent::Result(path) = &event {
                                result = Some(path.clone());
                            }
                            on_event(event);
                        }
                        None if !line.trim().is_empty() => debug!(%line, "runner output"),
                        None => {}
                    },
                    Ok(None) => break,
                    Err(e) => {
                        // stdout is no longer drained past this point
                        warn!(error = %e, "runner stdout unreadable, stopping runner");
                        if let Err(e) = child.start_kill() {
                            warn!(error = %e, "failed to kill runner");
                        }
                        break;
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => return Err(kill(&mut child).await),
            status = child.wait() => status.map_err(|e| SegError::FileSystem {
                path: self.program.clone(),
                operation: "wait for runner".to_string(),
                source: e,
            })?,
        };
        let stderr = match stderr_task.await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => format!("<stderr unreadable: {e}>"),
            Err(e) => format!("<stderr reader failed: {e}>"),
        };

        if !status.success() {
            return Err(SegError::JobFailed {
                status,
                stderr: stderr.trim().to_string(),
            });
        }
        if !stderr.trim().is_empty() {
            debug!(stderr = %stderr.trim(), "runner diagnostics");
        }
        info!(%status, "runner exited");
        result.ok_or_else(|| SegError::Configuration {
            message: "runner exited successfully without reporting a result".to_string(),
        })
    }
}

async fn kill(child: &mut Child) -> SegError {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill runner");
    }
    info!("job cancelled");
    SegError::Cancelled
}

fn pipe_missing(name: &str) -> SegError {
    SegError::FileSystem {
        path: PathBuf::from(name),
        operation: "capture runner output".to_string(),
        source: std::io::Error::other("pipe not captured"),
    }
}

/// Parses the sidecar a finished job reported.
pub fn read_metadata(path: &Path) -> Result<JobMetadata> {
    JobMetadata::read(path)
}

/// Removes job temporaries; failures are only logged.
pub fn cleanup_artifacts(paths: &[PathBuf]) {
    remove_best_effort(paths)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};

    fn script(dir: &Path, body: &str) -> Result<PathBuf> {
        let path = dir.join("runner.sh");
        fs::write(&path, body)?;
        Ok(path)
    }

    fn supervisor(script: &Path) -> Supervisor {
        Supervisor::new("/bin/sh").with_args([script.as_os_str()])
    }

    fn params(dir: &Path) -> JobParameters {
        JobParameters::new(dir.join("in.png"), dir.join("out.tif"))
    }

    #[tokio::test]
    async fn relays_protocol_events_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = script(
            dir.path(),
            "echo PROGRESS:20\necho 'loading weights'\necho \"RESULT:$1\"\necho PROGRESS:100\n",
        )?;

        let mut events = Vec::new();
        let result = supervisor(&runner)
            .run(&params(dir.path()), |e| events.push(e), CancellationToken::new())
            .await?;

        assert_eq!(
            events,
            vec![
                JobEvent::Progress(10),
                JobEvent::Progress(20),
                JobEvent::Result(result.clone()),
                JobEvent::Progress(100),
            ]
        );
        // the runner echoed its parameter file, which must be gone by now
        assert!(result.to_string_lossy().ends_with(".json"));
        assert!(!result.exists());
        Ok(())
    }

    #[tokio::test]
    async fn non_zero_exit_surfaces_stderr_and_resets_progress() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = script(
            dir.path(),
            "echo PROGRESS:20\necho 'ERROR: model not found' >&2\nexit 1\n",
        )?;

        let mut events = Vec::new();
        let err = supervisor(&runner)
            .run(&params(dir.path()), |e| events.push(e), CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            SegError::JobFailed { status, stderr } => {
                assert_eq!(status.code(), Some(1));
                assert_eq!(stderr, "ERROR: model not found");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(events.last(), Some(&JobEvent::Progress(0)));
        assert!(!events.iter().any(|e| matches!(e, JobEvent::Result(_))));
        Ok(())
    }

    #[tokio::test]
    async fn success_without_result_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = script(dir.path(), "echo PROGRESS:50\n")?;
        let result = supervisor(&runner)
            .run(&params(dir.path()), |_| {}, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SegError::Configuration { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn environment_is_not_inherited() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = script(dir.path(), "echo \"RESULT:/${CARGO_MANIFEST_DIR:-clean}\"\n")?;
        let result = supervisor(&runner)
            .run(&params(dir.path()), |_| {}, CancellationToken::new())
            .await?;
        assert_eq!(result, PathBuf::from("/clean"));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_kills_the_runner() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = script(dir.path(), "echo PROGRESS:20\nsleep 30\n")?;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = supervisor(&runner)
            .run(&params(dir.path()), |_| {}, cancel)
            .await;
        assert!(matches!(result, Err(SegError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_stdout_stops_the_runner() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = script(dir.path(), "printf 'PROGRESS:\\377\\n'\nexec sleep 30\n")?;

        let started = Instant::now();
        let result = supervisor(&runner)
            .run(&params(dir.path()), |_| {}, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SegError::JobFailed { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_parameters_never_spawn() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut bad = params(dir.path());
        bad.subdivisions = 0;
        let mut events = Vec::new();
        let result = Supervisor::new("/definitely/missing/runner")
            .run(&bad, |e| events.push(e), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SegError::InvalidArgument { .. })));
        assert!(events.is_empty());
        Ok(())
    }

    #[test]
    fn cleanup_ignores_missing_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let present = dir.path().join("out_metadata.json");
        fs::write(&present, "{}")?;
        cleanup_artifacts(&[present.clone(), dir.path().join("never_written.png")]);
        assert!(!present.exists());
        Ok(())
    }
}
