//! CLI error types.

use idbscope_core::CoreError;
use thiserror::Error;

/// Result type for shell operations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors raised while running the shell.
#[derive(Debug, Error)]
pub enum CliError {
    /// Reading input or writing output failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A command line could not be parsed.
    #[error("line {line}: {message}")]
    Parse {
        /// 1-based input line.
        line: usize,
        /// What is wrong with it.
        message: String,
    },

    /// The session rejected a command.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Output could not be encoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Creates a parse error.
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}
