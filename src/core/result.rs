use std::fmt;

/// A single compilation request. Owned by the call that handles it.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub source: String,
}

impl CompileRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// Why a request could not produce either an artifact or diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    InvalidInput,
    IoError,
    Timeout,
    MissingArtifact,
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::InvalidInput => "invalid_input",
            FailureReason::IoError => "io_error",
            FailureReason::Timeout => "timeout",
            FailureReason::MissingArtifact => "missing_artifact",
            FailureReason::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one compilation request. Exactly one variant is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileResult {
    /// Compiler succeeded; the artifact as standard base-64 text
    Success { artifact_encoded: String },
    /// Compiler ran and rejected the program
    CompileFailure { diagnostics: String },
    /// The service could not produce a compiler verdict
    SystemFailure { reason: FailureReason },
}

impl CompileResult {
    pub fn system_failure(reason: FailureReason) -> Self {
        CompileResult::SystemFailure { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompileResult::Success { .. })
    }

    /// Short label used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            CompileResult::Success { .. } => "success",
            CompileResult::CompileFailure { .. } => "compile_failure",
            CompileResult::SystemFailure { .. } => "system_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_codes() {
        let codes: Vec<String> = [
            FailureReason::InvalidInput,
            FailureReason::IoError,
            FailureReason::Timeout,
            FailureReason::MissingArtifact,
            FailureReason::Cancelled,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(
            codes,
            ["invalid_input", "io_error", "timeout", "missing_artifact", "cancelled"]
        );
    }

    #[test]
    fn test_result_kind() {
        assert_eq!(
            CompileResult::Success {
                artifact_encoded: "AA==".into()
            }
            .kind(),
            "success"
        );
        assert_eq!(
            CompileResult::system_failure(FailureReason::Timeout).kind(),
            "system_failure"
        );
        assert!(!CompileResult::CompileFailure {
            diagnostics: "x".into()
        }
        .is_success());
    }
}
