use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KlackErr>;

#[derive(Error, Debug)]
pub enum KlackErr {
    /// The command string was empty after trimming.
    #[error("empty command")]
    EmptyCommand,

    /// The command could not be parsed as a shell script. Token lookup
    /// treats this as "no token found"; the evaluation engine surfaces the
    /// message in its response reason for traceability.
    #[error("failed to parse command: {0}")]
    ParseFailed(String),

    /// A token candidate was located but its shape is wrong (missing parts,
    /// wrong prefix, empty code list).
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// No exception token was present in the command.
    #[error("no exception token found")]
    TokenNotFound,

    /// The error-code portion of a token does not match the required
    /// `[A-Z]{2,10}[0-9]{1,5}` shape.
    #[error("invalid error code: {0}")]
    InvalidErrorCode(String),

    /// An audit or state write failed. The bypass decision already returned
    /// to the caller is never retracted because of this.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The crash-dump directory is missing or not a directory.
    #[error("invalid dump directory: {0}")]
    InvalidDumpDir(String),

    /// The configuration file exists but could not be deserialized.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
