use thiserror::Error;

/// One failed branch inside a `Parallel` node.
#[derive(Debug)]
pub struct BranchFailure {
    pub branch: String,
    pub error: Box<StepflowError>,
}

fn format_failures(failures: &[BranchFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.branch, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum StepflowError {
    // Construction errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported node type: {0}")]
    UnsupportedNodeType(String),

    // Execution errors
    #[error("Executor failed: {0}")]
    Executor(String),

    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    Timeout { step: String, timeout_ms: u64 },

    #[error("Step '{step}' failed after {attempts} attempt(s): {source}")]
    StepFailed {
        step: String,
        attempts: u32,
        #[source]
        source: Box<StepflowError>,
    },

    #[error("Sequence '{sequence}' failed at step '{step}': {source}")]
    SequenceFailed {
        sequence: String,
        step: String,
        #[source]
        source: Box<StepflowError>,
    },

    #[error("All {} step(s) in sequence '{sequence}' failed: {}", .errors.len(), .errors.join("; "))]
    SequenceExhausted {
        sequence: String,
        errors: Vec<String>,
        output: Box<crate::types::StepOutput>,
    },

    #[error("Loop '{name}' failed at iteration {iteration}: {source}")]
    IterationFailed {
        name: String,
        iteration: usize,
        #[source]
        source: Box<StepflowError>,
    },

    #[error("Parallel '{name}': {} of {total} branch(es) failed: {}", .failures.len(), format_failures(.failures))]
    ParallelFailed {
        name: String,
        total: usize,
        failures: Vec<BranchFailure>,
    },

    #[error("{node} failed in branch '{branch}': {source}")]
    BranchFailed {
        node: String,
        branch: String,
        #[source]
        source: Box<StepflowError>,
    },

    #[error("Run {run_id} failed at step '{step}': {source}")]
    RunFailed {
        run_id: String,
        step: String,
        #[source]
        source: Box<StepflowError>,
    },

    #[error("Run cancelled")]
    Cancelled,

    // Input errors
    #[error("Input validation failed: {0}")]
    Validation(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepflowError {
    /// Shorthand for an executor failure with a plain message.
    pub fn executor(message: impl Into<String>) -> Self {
        Self::Executor(message.into())
    }

    /// Whether this error is a cancellation. Cancellation is never wrapped,
    /// so only the top level needs checking.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error came out of node execution (as opposed to
    /// construction, validation, cancellation, or storage).
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            Self::Executor(_)
                | Self::Timeout { .. }
                | Self::StepFailed { .. }
                | Self::SequenceFailed { .. }
                | Self::SequenceExhausted { .. }
                | Self::IterationFailed { .. }
                | Self::ParallelFailed { .. }
                | Self::BranchFailed { .. }
                | Self::RunFailed { .. }
        )
    }

    /// Walk the `source()` chain down to the innermost cause.
    pub fn root_cause(&self) -> &StepflowError {
        match self {
            Self::StepFailed { source, .. }
            | Self::SequenceFailed { source, .. }
            | Self::IterationFailed { source, .. }
            | Self::BranchFailed { source, .. }
            | Self::RunFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, StepflowError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn step_failed_names_step_and_attempts() {
        let err = StepflowError::StepFailed {
            step: "fetch".into(),
            attempts: 3,
            source: Box::new(StepflowError::executor("boom")),
        };
        let msg = err.to_string();
        assert!(msg.contains("'fetch'"));
        assert!(msg.contains("3 attempt(s)"));
        assert!(msg.contains("boom"));
        assert!(err.source().is_some());
    }

    #[test]
    fn root_cause_unwraps_nested_context() {
        let err = StepflowError::RunFailed {
            run_id: "r1".into(),
            step: "seq".into(),
            source: Box::new(StepflowError::SequenceFailed {
                sequence: "seq".into(),
                step: "inner".into(),
                source: Box::new(StepflowError::executor("disk full")),
            }),
        };
        assert!(matches!(err.root_cause(), StepflowError::Executor(m) if m == "disk full"));
        assert!(err.is_execution());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn parallel_failure_lists_branches() {
        let err = StepflowError::ParallelFailed {
            name: "fanout".into(),
            total: 3,
            failures: vec![
                BranchFailure {
                    branch: "a".into(),
                    error: Box::new(StepflowError::executor("x")),
                },
                BranchFailure {
                    branch: "b".into(),
                    error: Box::new(StepflowError::executor("y")),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Parallel 'fanout': 2 of 3 branch(es) failed: a: Executor failed: x; b: Executor failed: y"
        );
    }

    #[test]
    fn cancelled_is_not_execution() {
        assert!(StepflowError::Cancelled.is_cancelled());
        assert!(!StepflowError::Cancelled.is_execution());
    }
}
