//! Direct process runner
//!
//! Spawns the program with `tokio::process::Command` in its own process
//! group, with an empty environment and POSIX resource limits applied before
//! exec. Deadline and cancellation kill the whole group.

use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::capture::{read_bounded, CapturedOutput};
use super::{CommandSpec, RunLimits, RunOutcome, RunStatus, Runner};
use crate::core::{CancelToken, ServiceError};

/// How long to wait for output pipes to close once the child is gone
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Runner that executes programs directly on the host
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    drain_grace: Duration,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// Run a program to completion, deadline, or cancellation
    pub async fn execute(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, ServiceError> {
        debug!("Running {} with args: {:?}", cmd.program, cmd.args);

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .env_clear()
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir);
        }

        let rlimits = ResourceLimits::from_limits(limits);
        // SAFETY: the closure runs between fork and exec and only calls
        // setrlimit, which is async-signal-safe; it does not allocate.
        unsafe {
            command.pre_exec(move || rlimits.apply());
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| ServiceError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;
        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));

        let mut stdout_task = spawn_capture(child.stdout.take(), limits.max_output_bytes);
        let mut stderr_task = spawn_capture(child.stderr.take(), limits.max_output_bytes);

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(limits.wall_time) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        // Always take down the group: descendants may still hold the pipes.
        kill_group(pgid);

        let status = match waited {
            Waited::Exited(Ok(status)) => status_from_exit(status),
            Waited::Exited(Err(e)) => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(ServiceError::Wait(e));
            }
            Waited::TimedOut => {
                let _ = child.kill().await;
                warn!(
                    "{} exceeded {}ms, process group killed",
                    cmd.program,
                    limits.wall_time.as_millis()
                );
                RunStatus::TimedOut
            }
            Waited::Cancelled => {
                let _ = child.kill().await;
                debug!("{} cancelled, process group killed", cmd.program);
                RunStatus::Cancelled
            }
        };
        let elapsed = started.elapsed();

        let stdout = self.collect(&mut stdout_task, "stdout").await;
        let stderr = self.collect(&mut stderr_task, "stderr").await;

        debug!(
            "{} finished: status={:?}, elapsed_ms={}, stdout={}B, stderr={}B",
            cmd.program,
            status,
            elapsed.as_millis(),
            stdout.bytes.len(),
            stderr.bytes.len()
        );

        Ok(RunOutcome {
            status,
            stdout,
            stderr,
            elapsed,
        })
    }

    async fn collect(
        &self,
        task: &mut JoinHandle<io::Result<CapturedOutput>>,
        stream: &str,
    ) -> CapturedOutput {
        match tokio::time::timeout(self.drain_grace, &mut *task).await {
            Ok(Ok(Ok(output))) => output,
            Ok(Ok(Err(e))) => {
                warn!("Failed to read compiler {}: {}", stream, e);
                CapturedOutput::default()
            }
            Ok(Err(e)) => {
                warn!("Capture task for {} failed: {}", stream, e);
                CapturedOutput::default()
            }
            Err(_) => {
                warn!("Compiler {} still open after exit, abandoning capture", stream);
                task.abort();
                CapturedOutput::default()
            }
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, ServiceError> {
        self.execute(cmd, limits, cancel).await
    }
}

enum Waited {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

fn spawn_capture<R>(stream: Option<R>, cap: usize) -> JoinHandle<io::Result<CapturedOutput>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match stream {
            Some(stream) => read_bounded(stream, cap).await,
            None => Ok(CapturedOutput::default()),
        }
    })
}

fn status_from_exit(status: ExitStatus) -> RunStatus {
    if let Some(code) = status.code() {
        return RunStatus::Exited(code);
    }
    match status.signal() {
        // RLIMIT_CPU ran out before the wall clock did
        Some(sig) if sig == Signal::SIGXCPU as i32 => RunStatus::TimedOut,
        Some(sig) => RunStatus::Signaled(sig),
        None => RunStatus::Exited(-1),
    }
}

fn kill_group(pgid: Option<Pid>) {
    let Some(pgid) = pgid else {
        return;
    };
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

/// Limits applied in the child before exec
#[derive(Debug, Clone, Copy)]
struct ResourceLimits {
    cpu_secs: u64,
    file_bytes: u64,
    address_space_bytes: Option<u64>,
}

impl ResourceLimits {
    fn from_limits(limits: &RunLimits) -> Self {
        // CPU limit trails the wall clock so the deadline normally fires first
        let cpu_secs = limits.wall_time.as_secs_f64().ceil() as u64 + 1;
        let address_space_bytes = if limits.memory_mb == 0 {
            None
        } else {
            Some(limits.memory_mb.saturating_mul(1024 * 1024))
        };
        Self {
            cpu_secs,
            file_bytes: limits.max_file_bytes,
            address_space_bytes,
        }
    }

    fn apply(&self) -> io::Result<()> {
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs)?;
        setrlimit(Resource::RLIMIT_FSIZE, self.file_bytes, self.file_bytes)?;
        if let Some(bytes) = self.address_space_bytes {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel_pair;
    use tokio_test::assert_err;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh")
            .with_args(["-c", script])
            .with_env([("PATH", std::env::var("PATH").unwrap_or_default())])
    }

    fn limits(wall_ms: u64) -> RunLimits {
        RunLimits {
            wall_time: Duration::from_millis(wall_ms),
            max_output_bytes: 4096,
            max_file_bytes: 1024 * 1024,
            memory_mb: 0,
        }
    }

    #[tokio::test]
    async fn test_captures_exit_code_and_streams() {
        let runner = ProcessRunner::new();
        let outcome = runner
            .execute(
                &sh("echo out; echo err >&2; exit 3"),
                &limits(5_000),
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Exited(3));
        assert_eq!(outcome.stdout.to_text(), "out\n");
        assert_eq!(outcome.stderr.to_text(), "err\n");
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_success() {
        let runner = ProcessRunner::new();
        let outcome = runner
            .execute(&sh("true"), &limits(5_000), &CancelToken::never())
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_ne!(outcome.status, RunStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let runner = ProcessRunner::new();
        let started = Instant::now();
        let outcome = runner
            .execute(&sh("sleep 30"), &limits(300), &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_descendants() {
        let runner = ProcessRunner::new();
        let started = Instant::now();
        let outcome = runner
            .execute(
                &sh("sleep 30 & sleep 30; wait"),
                &limits(300),
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::TimedOut);
        // The background sleep holds the pipes; group kill releases them
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let runner = ProcessRunner::new();
        let (handle, token) = cancel_pair();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let outcome = runner
            .execute(&sh("sleep 30"), &limits(20_000), &token)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let runner = ProcessRunner::new();
        let outcome = runner
            .execute(
                &sh("head -c 200000 /dev/zero; head -c 200000 /dev/zero >&2"),
                &limits(5_000),
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.stdout.bytes.len(), 4096);
        assert!(outcome.stdout.truncated);
        assert_eq!(outcome.stderr.bytes.len(), 4096);
        assert!(outcome.stderr.truncated);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = ProcessRunner::new();
        let cmd = CommandSpec::new("/nonexistent/zxbc").with_args(["program.bas"]);
        let err = assert_err!(runner.execute(&cmd, &limits(1_000), &CancelToken::never()).await);
        assert!(matches!(err, ServiceError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("ZXBASIC_TEST_LEAK", "leaked");
        let runner = ProcessRunner::new();
        let outcome = runner
            .execute(
                &sh("echo \"${ZXBASIC_TEST_LEAK:-unset}\""),
                &limits(5_000),
                &CancelToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stdout.to_text(), "unset\n");
    }

    #[tokio::test]
    async fn test_runs_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new();
        let outcome = runner
            .execute(
                &sh("pwd").with_work_dir(dir.path()),
                &limits(5_000),
                &CancelToken::never(),
            )
            .await
            .unwrap();

        let reported = outcome.stdout.to_text();
        let reported = std::fs::canonicalize(reported.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_killed_by_signal() {
        let runner = ProcessRunner::new();
        let outcome = runner
            .execute(&sh("kill -KILL $$"), &limits(5_000), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Signaled(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_file_size_limit_applies() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new();
        let mut small = limits(5_000);
        small.max_file_bytes = 1024;

        let outcome = runner
            .execute(
                &sh("head -c 100000 /dev/zero > big.bin").with_work_dir(dir.path()),
                &small,
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert!(!outcome.is_success());
        let written = std::fs::metadata(dir.path().join("big.bin")).unwrap().len();
        assert!(written <= 1024);
    }

    #[test]
    fn test_cpu_limit_trails_wall_clock() {
        let rl = ResourceLimits::from_limits(&limits(1_500));
        assert_eq!(rl.cpu_secs, 3);
        assert_eq!(rl.address_space_bytes, None);

        let mut with_memory = limits(8_000);
        with_memory.memory_mb = 256;
        let rl = ResourceLimits::from_limits(&with_memory);
        assert_eq!(rl.cpu_secs, 9);
        assert_eq!(rl.address_space_bytes, Some(256 * 1024 * 1024));
    }
}
