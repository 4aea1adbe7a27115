//! Error taxonomy for the linearization engine.
//!
//! Every failure is fatal for the run that produced it; [`FailureClass`] groups the
//! variants so front ends can print a single message per class.

use std::fmt;

use thiserror::Error;

use crate::equation_engine::EquationError;

pub type Result<T> = std::result::Result<T, SysIdError>;

#[derive(Debug, Error)]
pub enum SysIdError {
    #[error("{0}")]
    Config(String),

    #[error("missing trajectory data: {0}")]
    MissingData(String),

    #[error("{what} dimension mismatch: expected {expected}, got {got}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("could not load model: {0}")]
    ModelLoad(String),

    #[error("could not compile model equations: {0}")]
    Equation(#[from] EquationError),

    #[error("could not allocate simulation context: {0}")]
    ContextAllocation(String),

    #[error("malformed {source_name}: token {index} ({token:?}) is not a number.")]
    Parse {
        source_name: String,
        index: usize,
        token: String,
    },

    #[error("malformed report at line {line}: {message}")]
    Report { line: usize, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("step {step} lies outside the worker block {start}..{end}.")]
    StepOutsideBlock {
        step: usize,
        start: usize,
        end: usize,
    },

    #[error("worker {0} panicked before finishing its block.")]
    WorkerPanicked(usize),
}

/// Coarse grouping of [`SysIdError`] used for user-facing reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Configuration,
    Resource,
    Input,
    Internal,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureClass::Configuration => "configuration error",
            FailureClass::Resource => "resource error",
            FailureClass::Input => "input error",
            FailureClass::Internal => "internal error",
        };
        f.write_str(label)
    }
}

impl SysIdError {
    pub fn config(message: impl Into<String>) -> Self {
        SysIdError::Config(message.into())
    }

    pub fn class(&self) -> FailureClass {
        match self {
            SysIdError::Config(_)
            | SysIdError::MissingData(_)
            | SysIdError::DimensionMismatch { .. }
            | SysIdError::ModelLoad(_)
            | SysIdError::Equation(_) => FailureClass::Configuration,
            SysIdError::ContextAllocation(_) | SysIdError::Io(_) => FailureClass::Resource,
            SysIdError::Parse { .. } | SysIdError::Report { .. } => FailureClass::Input,
            SysIdError::StepOutsideBlock { .. } | SysIdError::WorkerPanicked(_) => {
                FailureClass::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FailureClass, SysIdError};

    #[test]
    fn classes_group_related_failures() {
        assert_eq!(
            SysIdError::config("bad").class(),
            FailureClass::Configuration
        );
        assert_eq!(
            SysIdError::MissingData("controls".into()).class(),
            FailureClass::Configuration
        );
        assert_eq!(
            SysIdError::ContextAllocation("oom".into()).class(),
            FailureClass::Resource
        );
        assert_eq!(SysIdError::WorkerPanicked(2).class(), FailureClass::Internal);
    }

    #[test]
    fn dimension_mismatch_message_names_both_sizes() {
        let err = SysIdError::DimensionMismatch {
            what: "control vector",
            expected: 3,
            got: 2,
        };
        assert_eq!(
            err.to_string(),
            "control vector dimension mismatch: expected 3, got 2."
        );
        assert_eq!(FailureClass::Configuration.to_string(), "configuration error");
    }
}
