//! Error types for the backup engine.
//!
//! Job-level failures (missing source root, bad selection, job store problems)
//! are returned as `BackupError`. Per-file failures are also expressed as
//! `BackupError`, but the engine records them on the job's `BackupState` and
//! keeps going instead of propagating them.

use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = BackupError> = std::result::Result<T, E>;

/// Coarse classification of a `BackupError`, stable enough for callers to match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DirectoryNotFound,
    InvalidSelection,
    AlreadyRunning,
    Transfer,
    Encryption,
    JobStore,
    Io,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("source directory not found: {}", path.display())]
    DirectoryNotFound { path: PathBuf },

    #[error("invalid selection `{token}`: {reason}")]
    InvalidSelection { token: String, reason: String },

    #[error("job `{0}` is already running")]
    AlreadyRunning(String),

    #[error("failed to transfer {}: {message}", path.display())]
    Transfer { path: PathBuf, message: String },

    #[error("failed to encrypt {}: {message}", path.display())]
    Encryption { path: PathBuf, message: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("a job named `{0}` already exists")]
    DuplicateJob(String),

    #[error("job limit reached ({0} jobs)")]
    JobLimitReached(usize),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DirectoryNotFound { .. } => ErrorKind::DirectoryNotFound,
            Self::InvalidSelection { .. } => ErrorKind::InvalidSelection,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::Transfer { .. } => ErrorKind::Transfer,
            Self::Encryption { .. } => ErrorKind::Encryption,
            Self::JobNotFound(_)
            | Self::DuplicateJob(_)
            | Self::JobLimitReached(_)
            | Self::InvalidJob(_) => ErrorKind::JobStore,
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn selection(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSelection {
            token: token.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transfer(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Transfer {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Convert a failed `spawn_blocking` join into an I/O error.
pub(crate) fn join_error(err: tokio::task::JoinError) -> BackupError {
    BackupError::Io(io::Error::other(err))
}
