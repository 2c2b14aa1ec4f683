use std::path::PathBuf;

use stepwise_core::EngineError;
use thiserror::Error;

/// Errors raised while loading files from disk.
#[derive(Debug, Error)]
pub enum InfraError {
    /// Filesystem I/O failure.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML/JSON/TOML parse failure.
    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    /// Not a `.yaml`, `.yml`, or `.json` file.
    #[error("unsupported workflow file format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    /// Parsed, but structurally invalid.
    #[error("invalid workflow in {}: {source}", .path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: EngineError,
    },
}

impl InfraError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        InfraError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        InfraError::Parse {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
