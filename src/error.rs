//! Failure kinds raised by the helper.
//!
//! Operations return `anyhow::Result` and raise these as the root cause, so callers that care about
//! the kind can `downcast_ref::<Error>()` while everyone else just sees a readable chain.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Access denied to {path:?}: {reason}")]
    AccessDenied { path: PathBuf, reason: &'static str },

    #[error("Failed to look up {0}")]
    LookupFailure(String),

    #[error("{0}")]
    PrivilegeError(String),

    #[error("{0}")]
    MountError(String),

    #[error("{what}: {source}")]
    Io {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed with status {status}")]
    SubprocessFailure { command: String, status: i32 },

    #[error("{0}")]
    ArgumentError(String),
}

impl Error {
    pub fn access_denied(path: impl Into<PathBuf>, reason: &'static str) -> Self {
        Self::AccessDenied {
            path: path.into(),
            reason,
        }
    }

    pub fn io(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            what: what.into(),
            source,
        }
    }
}

/// Finds the helper error kind anywhere in an error chain.
pub fn kind_of(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}
