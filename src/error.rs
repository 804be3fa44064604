//! Error types for scan compilation and execution.
//!
//! `ScanError` separates the failure classes the orchestrator has to treat
//! differently:
//!
//! - **`Usage`**: malformed arity, shape or argument type. Always raised before
//!   any device motion, so the caller can fix the command and retry.
//! - **`ShapeMismatch`**: two positions of incompatible length were combined.
//!   A usage error in every respect except its message.
//! - **`ExecutionFailed`**: the execution engine terminated abnormally for a
//!   reason other than an explicit user halt. The engine error is kept as the
//!   source.
//! - **`Device`**: an axis failed while being sampled, moved or read outside
//!   the engine.
//! - **`NotIdle`**: the command was invoked while a previous invocation was
//!   still in progress.
//!
//! A user halt is deliberately absent: it is reported as
//! [`RunOutcome::Halted`](crate::scan::engine::RunOutcome::Halted), never as an
//! error.

use crate::scan::orchestrator::ScanState;
use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Errors raised while compiling or executing a scan command.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The command arguments do not fit the required pattern.
    #[error("{command}: {reason}. Usage: {usage}")]
    Usage {
        /// Scan command the arguments were given to
        command: String,
        /// Required argument pattern
        usage: String,
        /// What was wrong
        reason: String,
    },

    /// Position arithmetic on vectors of different lengths.
    #[error("position shape mismatch: cannot combine a position of length {left} with one of length {right}")]
    ShapeMismatch {
        /// Length of the left operand
        left: usize,
        /// Length of the right operand
        right: usize,
    },

    /// The execution engine failed for a reason other than a user halt.
    #[error("scan failed: {0:#}")]
    ExecutionFailed(#[source] anyhow::Error),

    /// An axis failed outside the execution engine.
    #[error("axis '{axis}' failed: {source:#}")]
    Device {
        /// Name of the failing axis
        axis: String,
        /// Underlying device error
        #[source]
        source: anyhow::Error,
    },

    /// The command is already executing.
    #[error("cannot start scan: command is {0}")]
    NotIdle(ScanState),
}

impl ScanError {
    /// Build a usage error for the generic `scan` grammar.
    ///
    /// The orchestrator rewrites command and usage with [`ScanError::for_command`]
    /// once the concrete scan type is known.
    pub fn usage(reason: impl Into<String>) -> Self {
        ScanError::Usage {
            command: "scan".to_string(),
            usage: crate::scan::syntax::GENERIC_USAGE.to_string(),
            reason: reason.into(),
        }
    }

    /// Build a usage error for a specific command and pattern.
    pub fn usage_for(command: &str, usage: &str, reason: impl Into<String>) -> Self {
        ScanError::Usage {
            command: command.to_string(),
            usage: usage.to_string(),
            reason: reason.into(),
        }
    }

    /// Wrap a device error with the name of the axis that raised it.
    pub fn device(axis: &str, source: anyhow::Error) -> Self {
        ScanError::Device {
            axis: axis.to_string(),
            source,
        }
    }

    /// Attach the scan command and its usage pattern to a usage error.
    ///
    /// A [`ScanError::ShapeMismatch`] becomes a [`ScanError::Usage`] whose
    /// reason is the mismatch message. Any other variant is returned unchanged.
    #[must_use]
    pub fn for_command(self, command: &str, usage: &str) -> Self {
        match self {
            ScanError::Usage { reason, .. } => ScanError::usage_for(command, usage, reason),
            mismatch @ ScanError::ShapeMismatch { .. } => {
                ScanError::usage_for(command, usage, mismatch.to_string())
            }
            other => other,
        }
    }

    /// True for errors caught before any device motion.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            ScanError::Usage { .. } | ScanError::ShapeMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_message_names_command_and_pattern() {
        let err = ScanError::usage_for("ascan", "ascan axis start stop n", "expected 3 numbers");
        let text = err.to_string();
        assert!(text.contains("ascan"));
        assert!(text.contains("ascan axis start stop n"));
        assert!(text.contains("expected 3 numbers"));
    }

    #[test]
    fn for_command_names_command_on_usage_and_shape_errors() {
        let err = ScanError::usage("bad token").for_command("dscan", "dscan axis start stop n");
        match err {
            ScanError::Usage {
                command, reason, ..
            } => {
                assert_eq!(command, "dscan");
                assert_eq!(reason, "bad token");
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        let err = ScanError::ShapeMismatch { left: 2, right: 3 }
            .for_command("dscan", "dscan axis start stop n");
        assert!(matches!(err, ScanError::Usage { .. }));
        let text = err.to_string();
        assert!(text.starts_with("dscan: position shape mismatch"), "{text}");
        assert!(text.contains("length 2"), "{text}");
        assert!(text.contains("Usage: dscan axis start stop n"), "{text}");

        let err = ScanError::ExecutionFailed(anyhow::anyhow!("boom")).for_command("dscan", "x");
        assert!(matches!(err, ScanError::ExecutionFailed(_)));
    }

    #[test]
    fn shape_mismatch_counts_as_usage() {
        assert!(ScanError::ShapeMismatch { left: 1, right: 2 }.is_usage());
        assert!(!ScanError::ExecutionFailed(anyhow::anyhow!("boom")).is_usage());
    }

    #[test]
    fn execution_failure_preserves_engine_error() {
        let err = ScanError::ExecutionFailed(anyhow::anyhow!("detector timeout"));
        assert!(err.to_string().contains("detector timeout"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
