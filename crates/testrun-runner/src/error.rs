//! Run errors.

use thiserror::Error;

use testrun_core::{CoreError, TestFile};

/// Errors that prevent a run from starting.
///
/// Anything that goes wrong after dispatch begins is reported as a run event
/// instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("No test files to run")]
    NoTestFiles,

    #[error("Test file listed twice: {0}")]
    DuplicateTestFile(TestFile),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidEnv { key: &'static str, value: String },

    #[error(transparent)]
    Core(#[from] CoreError),
}
