use std::process::{ExitCode, Termination};

/// Top-level, fatal (programmer-error class) failures.
///
/// Per the error model, cluster-fit failures and per-sample decode
/// failures are *not* represented here: they are recoverable and are
/// handled as values inside [`crate::cnv`], not propagated as a
/// process-aborting error.
#[derive(thiserror::Error, Debug, Clone)]
pub enum AppError {
    #[error("number of states in transition matrix ({trans_states}) does not match likelihood tensor ({tensor_states})")]
    ShapeMismatch {
        trans_states: usize,
        tensor_states: usize,
    },
}

impl Termination for AppError {
    fn report(self) -> ExitCode {
        match self {
            AppError::ShapeMismatch { .. } => ExitCode::from(1),
        }
    }
}
