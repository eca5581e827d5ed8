//! `tokio::process` backed tool runner.

use super::{ToolCommand, ToolEnvironment, ToolOutcome, ToolRunner};
use crate::errors::{DemflowError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to keep reading pipes after the child has exited.
///
/// Grandchildren that detach from the process group can hold a pipe open
/// past the child's exit.
const DEFAULT_DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// Runs tools as child processes with a timeout.
#[derive(Debug, Clone)]
pub struct ProcessToolRunner {
    environment: ToolEnvironment,
    drain_limit: Duration,
}

impl ProcessToolRunner {
    /// Creates a runner using the given child environment.
    #[must_use]
    pub fn new(environment: ToolEnvironment) -> Self {
        Self {
            environment,
            drain_limit: DEFAULT_DRAIN_LIMIT,
        }
    }

    /// Sets how long output is drained after the child exits.
    #[must_use]
    pub fn with_drain_limit(mut self, limit: Duration) -> Self {
        self.drain_limit = limit;
        self
    }

    /// Returns the child environment.
    #[must_use]
    pub fn environment(&self) -> &ToolEnvironment {
        &self.environment
    }

    /// Resolves a bare program name against the search directories.
    fn resolve_program(&self, program: &str) -> PathBuf {
        if program.contains(std::path::MAIN_SEPARATOR) {
            return PathBuf::from(program);
        }
        self.environment
            .search_paths
            .iter()
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(program))
    }

    async fn collect(&self, handle: Option<JoinHandle<()>>, buffer: &Arc<Mutex<Vec<u8>>>) -> String {
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.drain_limit, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        let bytes = std::mem::take(&mut *buffer.lock());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Default for ProcessToolRunner {
    fn default() -> Self {
        Self::new(ToolEnvironment::default())
    }
}

/// Sends `SIGKILL` to the child's whole process group.
///
/// The stereo tools are wrapper scripts that fork workers; killing only the
/// leader leaves them running.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    killpg(Pid::from_raw(pid), Signal::SIGKILL).map_err(std::io::Error::from)
}

fn spawn_reader<R>(mut pipe: R, buffer: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.lock().extend_from_slice(&chunk[..n]),
            }
        }
    })
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(&self, cmd: &ToolCommand) -> Result<ToolOutcome> {
        let program = self.resolve_program(&cmd.program);

        let mut std_command = std::process::Command::new(&program);
        // The child leads its own group so a timeout can kill its workers too.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut std_command, 0);
        let mut command = Command::from(std_command);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.working_dir {
            command.current_dir(dir);
        }
        if let Some(path) = self.environment.child_path(std::env::var_os("PATH")) {
            command.env("PATH", path);
        }
        for (key, value) in self.environment.overrides() {
            command.env(key, value);
        }
        command.envs(&cmd.env);

        debug!(
            program = %program.display(),
            command = %cmd.command_line(),
            timeout_secs = cmd.timeout.as_secs_f64(),
            "Launching tool"
        );

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| DemflowError::ToolLaunch {
            program: cmd.program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stdout_buf)));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stderr_buf)));

        let (exit_code, timed_out) = match tokio::time::timeout(cmd.timeout, child.wait()).await {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                warn!(
                    program = %cmd.program,
                    pid = ?pid,
                    timeout_secs = cmd.timeout.as_secs_f64(),
                    "Tool timed out, killing"
                );
                #[cfg(unix)]
                if let Some(pid) = pid {
                    if let Err(e) = kill_process_group(pid) {
                        warn!(program = %cmd.program, error = %e, "Killing process group failed");
                    }
                }
                // kill() also reaps the leader.
                if let Err(e) = child.kill().await {
                    warn!(program = %cmd.program, error = %e, "Kill after timeout failed");
                }
                (None, true)
            }
        };
        let elapsed = started.elapsed();

        let stdout = self.collect(stdout_task, &stdout_buf).await;
        let stderr = self.collect(stderr_task, &stderr_buf).await;

        debug!(
            program = %cmd.program,
            exit_code = ?exit_code,
            timed_out,
            elapsed_ms = crate::utils::millis(elapsed),
            "Tool finished"
        );

        Ok(ToolOutcome {
            exit_code,
            stdout,
            stderr,
            timed_out,
            elapsed,
            pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let runner = ProcessToolRunner::default();
        let cmd = ToolCommand::new("sh", Duration::from_secs(10))
            .arg("-c")
            .arg("echo converted; echo 'missing band' >&2; exit 3");

        let outcome = runner.run(&cmd).await.unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout, "converted\n");
        assert_eq!(outcome.stderr, "missing band\n");
        assert!(!outcome.timed_out);
        assert!(!outcome.success());
    }

    #[cfg(target_os = "linux")]
    /// True while `/proc/<pid>` shows a process that is neither dead nor a
    /// zombie waiting for its new parent to reap it.
    fn is_running(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
            let state = stat.rsplit(')').next().and_then(|rest| rest.trim_start().chars().next());
            !matches!(state, Some('Z' | 'X') | None)
        })
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let runner = ProcessToolRunner::default();
        let cmd = ToolCommand::new("sleep", Duration::from_millis(200)).arg("30");

        let outcome = runner.run(&cmd).await.unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.elapsed < Duration::from_secs(10));
        let pid = outcome.pid.unwrap();
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_forked_workers() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessToolRunner::default();
        let cmd = ToolCommand::new("sh", Duration::from_millis(300))
            .arg("-c")
            .arg("sleep 30 & echo $! > worker.pid; echo started; wait")
            .current_dir(dir.path());

        let started = Instant::now();
        let outcome = runner.run(&cmd).await.unwrap();

        assert!(outcome.timed_out);
        // Output is not held hostage by the worker's open pipes.
        assert!(started.elapsed() < DEFAULT_DRAIN_LIMIT);
        assert_eq!(outcome.stdout, "started\n");

        let worker: u32 = std::fs::read_to_string(dir.path().join("worker.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while is_running(worker) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!is_running(worker), "worker {worker} survived the timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_executable_file_is_launch_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("aster2asp");
        std::fs::write(&script, "#!/bin/sh\necho never\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        let runner = ProcessToolRunner::default();
        let cmd = ToolCommand::new(script.display().to_string(), Duration::from_secs(1));

        let err = runner.run(&cmd).await.unwrap_err();

        assert_eq!(err.code(), "ToolLaunchError");
        match err {
            DemflowError::ToolLaunch { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let runner = ProcessToolRunner::default();
        let cmd = ToolCommand::new("demflow-no-such-tool", Duration::from_secs(1));

        let err = runner.run(&cmd).await.unwrap_err();

        assert_eq!(err.code(), "ToolLaunchError");
    }

    #[tokio::test]
    async fn test_env_overrides_reach_child_only() {
        let runner = ProcessToolRunner::new(
            ToolEnvironment::new()
                .with_variable("DEMFLOW_TEST_VAR", "from-config")
                .with_api_key("key-1"),
        );
        let cmd = ToolCommand::new("sh", Duration::from_secs(10))
            .arg("-c")
            .arg("echo $DEMFLOW_TEST_VAR $OPENTOPOGRAPHY_API_KEY $PER_CMD")
            .env("PER_CMD", "cmd");

        let outcome = runner.run(&cmd).await.unwrap();

        assert_eq!(outcome.stdout.trim(), "from-config key-1 cmd");
        assert!(std::env::var_os("DEMFLOW_TEST_VAR").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_search_path_resolves_bare_name() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-point2dem");
        std::fs::write(&script, "#!/bin/sh\necho fake \"$@\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ProcessToolRunner::new(ToolEnvironment::new().with_search_path(dir.path()));
        let cmd = ToolCommand::new("fake-point2dem", Duration::from_secs(10)).arg("--tr");

        let outcome = runner.run(&cmd).await.unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.stdout, "fake --tr\n");
    }

    #[tokio::test]
    async fn test_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessToolRunner::default();
        let cmd = ToolCommand::new("pwd", Duration::from_secs(10)).current_dir(dir.path());

        let outcome = runner.run(&cmd).await.unwrap();

        let reported = PathBuf::from(outcome.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
