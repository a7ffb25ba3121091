// src/errors.rs
//
// =============================================================================
// NNPAL: ERROR TAXONOMY
// =============================================================================
//
// Typed failures raised by the library layer. Phase runners wrap these in
// `anyhow` with context; the binary logs the chain and exits with status 1.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A file the caller requires is absent.
    #[error("required file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A numeric or structural argument is outside its domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Phase ordering violated (gate flag missing or already set).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// An external program needed by the phase is not on PATH.
    #[error("required tool `{0}` not found in PATH")]
    MissingTool(String),

    /// An input file could not be decoded.
    #[error("cannot parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// Some jobs of the phase neither succeeded nor were overridden.
    #[error("{failed} of {total} jobs are not finished (create `skip` or `force` to override)")]
    Incomplete { failed: usize, total: usize },
}

impl PipelineError {
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
