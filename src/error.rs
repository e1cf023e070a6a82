//! Centralized error types for the mail engine.
//!
//! Only [`MailError::Parse`] and [`MailError::Compose`] are meant to reach the
//! caller of a whole operation. Validation problems are recovered where they
//! happen, transport problems are retried at the call site, and per-recipient
//! rejections are recorded as data on the recipient row.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mailengine library.
#[derive(Error, Debug)]
pub enum MailError {
    /// The input cannot be interpreted as a MIME message at all.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The draft is structurally invalid (e.g. no sender address).
    #[error("Compose error: {0}")]
    Compose(String),

    /// A single address or contact failed format validation.
    #[error("Invalid address: {0}")]
    Validation(String),

    /// Connection-level SMTP/IMAP failure (cannot connect or authenticate).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The storage collaborator failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// I/O error with the associated file path.
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience alias for `Result<T, MailError>`.
pub type Result<T> = std::result::Result<T, MailError>;

impl MailError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `NotFound` variant for an entity kind and id.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `MailError::io`).
impl From<std::io::Error> for MailError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
