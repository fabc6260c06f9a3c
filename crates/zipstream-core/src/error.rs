//! Archive streaming error types.

use std::io;

use thiserror::Error;

/// Errors that can occur while resolving or streaming an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("invalid archive identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("archive does not exist: {0}")]
    NotFound(String),

    #[error("failed to launch archiver `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("archive stream cancelled")]
    Cancelled,

    #[error("archive stream I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archiver failed: {0}")]
    ArchiverFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ArchiveError {
    /// HTTP status code for errors that surface before the response head
    /// is committed. Errors raised mid-stream cannot change the status.
    pub fn status_code(&self) -> u16 {
        match self {
            ArchiveError::InvalidIdentifier(_) => 400,
            ArchiveError::NotFound(_) => 404,
            ArchiveError::Cancelled => 499,
            ArchiveError::Launch { .. }
            | ArchiveError::Io(_)
            | ArchiveError::ArchiverFailed(_)
            | ArchiveError::Config(_) => 500,
        }
    }

    /// Whether the error is the expected result of a client going away
    /// or the server shutting down.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ArchiveError::Cancelled)
    }
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;
