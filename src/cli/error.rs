//! CLI error type

use std::path::PathBuf;

use table_sync::SyncError;
use thiserror::Error;

/// Errors surfaced by the `table-sync` binary
#[derive(Error, Debug)]
pub enum CliError {
    /// Bad or missing command-line argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Input file could not be read
    #[error("Failed to read {0}: {1}")]
    FileReadError(PathBuf, String),

    /// Input was not valid JSON
    #[error("Failed to parse input: {0}")]
    ParseError(String),

    /// Library failure
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl CliError {
    /// Message printed to stderr before exiting
    pub fn user_message(&self) -> String {
        match self {
            CliError::Sync(e) => e.user_message(),
            CliError::FileReadError(path, _) => format!(
                "{self}\n\nHint: Use '-' to read rows from stdin instead of {}.",
                path.display()
            ),
            _ => self.to_string(),
        }
    }

    /// Process exit code
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Sync(e) if e.is_precondition() => 2,
            CliError::Sync(_) => 1,
            _ => 2,
        }
    }
}
