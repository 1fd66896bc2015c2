//! Runner module - Process execution primitives
//!
//! This module runs one external program to completion under limits:
//! - Argument vector execution (never a shell)
//! - Wall-clock deadline and cancellation, both killing the process group
//! - Bounded capture of stdout/stderr
//!
//! The runner module does NOT:
//! - Know what the program is or which files it produces
//! - Decide whether an exit status is a compile error

pub mod capture;
pub mod process;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{CancelToken, ServiceError};

pub use capture::CapturedOutput;
pub use process::ProcessRunner;

/// Command specification for execution
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Complete environment of the child
    pub env: Vec<(String, String)>,
    /// Working directory
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            work_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env<K, V>(mut self, env: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

/// Resource limits for one run
#[derive(Debug, Clone)]
pub struct RunLimits {
    /// Wall-clock limit
    pub wall_time: Duration,
    /// Cap on each captured stream in bytes
    pub max_output_bytes: usize,
    /// Largest file the program may write in bytes
    pub max_file_bytes: u64,
    /// Address space limit in MB (0 = unlimited)
    pub memory_mb: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            wall_time: Duration::from_secs(8),
            max_output_bytes: 64 * 1024,
            max_file_bytes: 4 * 1024 * 1024,
            memory_mb: 1024,
        }
    }
}

/// Execution status (raw, no compile verdict interpretation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by a signal it did not receive from us
    Signaled(i32),
    /// Wall-clock or CPU limit exceeded; the process group was killed
    TimedOut,
    /// Caller cancelled; the process group was killed
    Cancelled,
}

/// Outcome of running a program
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    /// Wall-clock time from spawn to reap
    pub elapsed: Duration,
}

impl RunOutcome {
    /// Check if execution was successful (exited with code 0)
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Exited(0))
    }
}

/// Runner trait for executing programs
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command to completion, deadline, or cancellation
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, ServiceError>;
}
