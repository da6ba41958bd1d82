//! Startup error types.

use std::path::PathBuf;

use thiserror::Error;

/// Failures detected before the first connection attempt. Each maps to a
/// distinct process exit code so wrapper scripts can tell them apart.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Configuration error
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The input pipe could not be created.
    #[error("unable to create pipe {path}: {source}")]
    PipeCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The input pipe could not be opened.
    #[error("unable to open pipe {path}: {source}")]
    PipeOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stale data on the input pipe could not be flushed.
    #[error("unable to flush pipe {path}: {source}")]
    PipeFlush {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StartupError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::InvalidConfig(_) => 2,
            StartupError::PipeCreate { .. } => 3,
            StartupError::PipeOpen { .. } => 4,
            StartupError::PipeFlush { .. } => 5,
        }
    }
}
