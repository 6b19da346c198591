// src/errors.rs

//! Crate-wide error type and `Result` alias.
//!
//! The variants follow the failure taxonomy the minion reasons about:
//! - `NotFound`: machine or process absent from the registry (never retried)
//! - `Conflict`: a compare-and-swap precondition failed
//! - `Unavailable`: registry transport failure or request timeout
//! - `Supervision`: launching or terminating one OS process failed
//! - `Bootstrap`: the registry layout is missing or corrupt (fatal)
//!
//! `code()` plus the `Display` text is what callers at the API boundary see.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("supervision of process {proc_id} failed: {reason}")]
    Supervision { proc_id: String, reason: String },

    #[error("registry bootstrap invariant violated: {0}")]
    Bootstrap(String),

    #[error("corrupt registry data: {0}")]
    Corrupt(String),

    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn supervision(proc_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Supervision {
            proc_id: proc_id.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Unavailable(_) => "unavailable",
            Error::Supervision { .. } => "supervision_failure",
            Error::Bootstrap(_) => "bootstrap_invariant",
            Error::Corrupt(_) => "corrupt_data",
            Error::ShutdownTimeout(_) => "shutdown_timeout",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Other(_) => "internal",
        }
    }

    /// Errors after which a worker must stop rather than keep operating on
    /// inconsistent registry state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Bootstrap(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
