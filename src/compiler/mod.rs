//! Compiler module - External compiler invocation
//!
//! Builds the compiler command line from the configured profile, runs it
//! through a `Runner`, and classifies the outcome:
//! - exit 0 with a non-empty artifact: compiled
//! - non-zero exit or fatal signal: rejected, with diagnostics
//! - exit 0 without an artifact, deadline, cancellation: service error

use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::CompilerProfile;
use crate::core::{CancelToken, ServiceError};
use crate::runner::{CommandSpec, RunLimits, RunOutcome, RunStatus, Runner};

/// Classified result of one compiler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileVerdict {
    /// Compiler succeeded and wrote the artifact
    Compiled { artifact_path: PathBuf },
    /// Compiler rejected the source
    Rejected { diagnostics: String },
}

/// Invokes the external compiler described by a `CompilerProfile`
pub struct Compiler {
    profile: CompilerProfile,
    runner: Arc<dyn Runner>,
    /// Environment handed to the compiler, resolved once at startup
    env: Vec<(String, String)>,
}

impl Compiler {
    pub fn new(profile: CompilerProfile, runner: Arc<dyn Runner>) -> Self {
        let env = profile
            .env_passthrough
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect();

        Self {
            profile,
            runner,
            env,
        }
    }

    pub fn profile(&self) -> &CompilerProfile {
        &self.profile
    }

    /// Argument-vector command for compiling `source_path` into `artifact_path`
    pub fn command_for(&self, source_path: &Path, artifact_path: &Path, work_dir: &Path) -> CommandSpec {
        CommandSpec::new(&self.profile.program)
            .with_args(self.profile.render_args(source_path, artifact_path))
            .with_env(self.env.iter().cloned())
            .with_work_dir(work_dir)
    }

    /// Compile a staged source file inside `work_dir`
    pub async fn compile(
        &self,
        source_path: &Path,
        work_dir: &Path,
        limits: &RunLimits,
        cancel: &CancelToken,
    ) -> Result<CompileVerdict, ServiceError> {
        let artifact_path = work_dir.join(&self.profile.artifact_file);
        let cmd = self.command_for(source_path, &artifact_path, work_dir);

        debug!("Invoking compiler: {:?}", cmd.args);
        let outcome = self.runner.run(&cmd, limits, cancel).await?;

        let artifact_len = if outcome.is_success() {
            artifact_size(&artifact_path).await
        } else {
            None
        };

        let verdict = match classify(&outcome, artifact_len, limits, artifact_path)? {
            CompileVerdict::Rejected { diagnostics } => {
                info!(
                    "Compiler rejected source: status={:?}, diagnostics_len={}, elapsed_ms={}",
                    outcome.status,
                    diagnostics.len(),
                    outcome.elapsed.as_millis()
                );
                CompileVerdict::Rejected {
                    diagnostics: strip_work_dir(&diagnostics, work_dir),
                }
            }
            compiled => compiled,
        };
        Ok(verdict)
    }
}

/// Diagnostics refer to files by workspace-relative name only
fn strip_work_dir(text: &str, work_dir: &Path) -> String {
    let prefix = format!("{}/", work_dir.display());
    text.replace(&prefix, "")
}

async fn artifact_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

/// Map a run outcome onto the compile contract.
///
/// `artifact_len` is the size of the expected artifact, if it exists.
/// A failed run that still left an artifact behind is a rejection; the
/// artifact is ignored.
pub fn classify(
    outcome: &RunOutcome,
    artifact_len: Option<u64>,
    limits: &RunLimits,
    artifact_path: PathBuf,
) -> Result<CompileVerdict, ServiceError> {
    match outcome.status {
        RunStatus::TimedOut => Err(ServiceError::Timeout {
            limit_ms: limits.wall_time.as_millis(),
        }),
        RunStatus::Cancelled => Err(ServiceError::Cancelled),
        RunStatus::Exited(0) => match artifact_len {
            Some(len) if len > 0 => Ok(CompileVerdict::Compiled { artifact_path }),
            _ => Err(ServiceError::MissingArtifact),
        },
        RunStatus::Exited(_) | RunStatus::Signaled(_) => Ok(CompileVerdict::Rejected {
            diagnostics: diagnostics(outcome),
        }),
    }
}

/// Compiler diagnostics: stderr, falling back to stdout, then to a summary
fn diagnostics(outcome: &RunOutcome) -> String {
    if !outcome.stderr.is_blank() {
        return outcome.stderr.to_text();
    }
    if !outcome.stdout.is_blank() {
        return outcome.stdout.to_text();
    }
    match outcome.status {
        RunStatus::Exited(code) => format!("Compilation failed with exit code {}", code),
        RunStatus::Signaled(sig) => match Signal::try_from(sig) {
            Ok(signal) => format!("Compiler terminated by signal {}", signal.as_str()),
            Err(_) => format!("Compiler terminated by signal {}", sig),
        },
        RunStatus::TimedOut => "Compilation timed out".to_string(),
        RunStatus::Cancelled => "Compilation cancelled".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CapturedOutput, ProcessRunner};
    use std::time::Duration;

    fn outcome(status: RunStatus, stdout: &str, stderr: &str) -> RunOutcome {
        RunOutcome {
            status,
            stdout: CapturedOutput {
                bytes: stdout.as_bytes().to_vec(),
                truncated: false,
            },
            stderr: CapturedOutput {
                bytes: stderr.as_bytes().to_vec(),
                truncated: false,
            },
            elapsed: Duration::from_millis(10),
        }
    }

    fn artifact() -> PathBuf {
        PathBuf::from("/ws/program.tap")
    }

    #[test]
    fn test_success_with_artifact() {
        let verdict = classify(
            &outcome(RunStatus::Exited(0), "", ""),
            Some(42),
            &RunLimits::default(),
            artifact(),
        )
        .unwrap();
        assert_eq!(
            verdict,
            CompileVerdict::Compiled {
                artifact_path: artifact()
            }
        );
    }

    #[test]
    fn test_success_without_artifact_is_missing() {
        let err = classify(
            &outcome(RunStatus::Exited(0), "", ""),
            None,
            &RunLimits::default(),
            artifact(),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::MissingArtifact));

        let err = classify(
            &outcome(RunStatus::Exited(0), "", ""),
            Some(0),
            &RunLimits::default(),
            artifact(),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::MissingArtifact));
    }

    #[test]
    fn test_nonzero_exit_prefers_stderr() {
        let verdict = classify(
            &outcome(RunStatus::Exited(1), "noise", "program.bas:10: error: Syntax Error"),
            None,
            &RunLimits::default(),
            artifact(),
        )
        .unwrap();
        assert_eq!(
            verdict,
            CompileVerdict::Rejected {
                diagnostics: "program.bas:10: error: Syntax Error".into()
            }
        );
    }

    #[test]
    fn test_nonzero_exit_falls_back_to_stdout() {
        let verdict = classify(
            &outcome(RunStatus::Exited(1), "error on stdout", "  \n"),
            None,
            &RunLimits::default(),
            artifact(),
        )
        .unwrap();
        assert_eq!(
            verdict,
            CompileVerdict::Rejected {
                diagnostics: "error on stdout".into()
            }
        );
    }

    #[test]
    fn test_nonzero_exit_without_output_is_summarised() {
        let verdict = classify(
            &outcome(RunStatus::Exited(2), "", ""),
            None,
            &RunLimits::default(),
            artifact(),
        )
        .unwrap();
        assert_eq!(
            verdict,
            CompileVerdict::Rejected {
                diagnostics: "Compilation failed with exit code 2".into()
            }
        );

        let verdict = classify(
            &outcome(RunStatus::Signaled(11), "", ""),
            None,
            &RunLimits::default(),
            artifact(),
        )
        .unwrap();
        assert_eq!(
            verdict,
            CompileVerdict::Rejected {
                diagnostics: "Compiler terminated by signal SIGSEGV".into()
            }
        );
    }

    #[test]
    fn test_partial_artifact_on_failure_is_rejected() {
        let verdict = classify(
            &outcome(RunStatus::Exited(1), "", "crashed mid-write"),
            Some(128),
            &RunLimits::default(),
            artifact(),
        )
        .unwrap();
        assert!(matches!(verdict, CompileVerdict::Rejected { .. }));
    }

    #[test]
    fn test_timeout_and_cancel_are_service_errors() {
        let limits = RunLimits {
            wall_time: Duration::from_millis(1500),
            ..RunLimits::default()
        };
        let err = classify(&outcome(RunStatus::TimedOut, "", ""), None, &limits, artifact())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Timeout { limit_ms: 1500 }));

        let err = classify(&outcome(RunStatus::Cancelled, "", ""), None, &limits, artifact())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled));
    }

    #[test]
    fn test_strip_work_dir() {
        let text = "/tmp/ws/1234/program.bas:10: error: Syntax Error";
        assert_eq!(
            strip_work_dir(text, Path::new("/tmp/ws/1234")),
            "program.bas:10: error: Syntax Error"
        );
    }

    #[test]
    fn test_command_uses_argument_vector() {
        let profile = CompilerProfile::embedded().unwrap();
        let compiler = Compiler::new(profile, Arc::new(ProcessRunner::new()));
        let cmd = compiler.command_for(
            Path::new("/ws/program.bas"),
            Path::new("/ws/program.tap"),
            Path::new("/ws"),
        );

        assert_eq!(cmd.program, "zxbc");
        assert_eq!(cmd.args.last().map(String::as_str), Some("/ws/program.bas"));
        assert_eq!(cmd.work_dir.as_deref(), Some(Path::new("/ws")));
    }

    #[tokio::test]
    async fn test_compile_with_stub_compiler() {
        let dir = tempfile::tempdir().unwrap();
        let profile = CompilerProfile::from_toml(
            r#"
program = "/bin/sh"
args = ["-c", "cp \"$0\" \"$1\"", "{source}", "{output}"]
source_file = "program.bas"
artifact_file = "program.tap"
env_passthrough = ["PATH"]
"#,
        )
        .unwrap();
        let compiler = Compiler::new(profile, Arc::new(ProcessRunner::new()));

        let source = dir.path().join("program.bas");
        std::fs::write(&source, "10 PRINT \"Hello\"").unwrap();

        let verdict = compiler
            .compile(&source, dir.path(), &RunLimits::default(), &CancelToken::never())
            .await
            .unwrap();

        let expected = dir.path().join("program.tap");
        assert_eq!(
            verdict,
            CompileVerdict::Compiled {
                artifact_path: expected.clone()
            }
        );
        assert_eq!(std::fs::read(expected).unwrap(), b"10 PRINT \"Hello\"");
    }
}
