//! Error types for the video-dl library.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::ErrorKind;

/// Errors that can occur while coordinating downloads.
#[derive(Error, Debug)]
pub enum Error {
    /// No network at request time, or the network went away mid-transfer.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The transfer engine reported a failure or timeout.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The transfer was cancelled before it finished.
    #[error("transfer cancelled")]
    Cancelled,

    /// Committing or removing a local artifact failed.
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        /// Path the operation targeted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A registration entry is not a usable source location.
    #[error("invalid source {input:?}: {reason}")]
    Validation {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The requested item or artifact does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O error outside of the local store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration could not be read or written.
    #[error("configuration error: {0}")]
    Config(String),

    /// The coordinator task is no longer running.
    #[error("channel error: {0}")]
    Channel(String),
}

impl Error {
    /// Builds a [`Error::Storage`] for `path`.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Classifies the error for the notification channel.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity(_) => ErrorKind::Connectivity,
            Self::Storage { .. } | Self::NotFound(_) => ErrorKind::Storage,
            Self::Validation { .. } | Self::Config(_) => ErrorKind::Validation,
            Self::Transfer(_)
            | Self::Cancelled
            | Self::Io(_)
            | Self::Http(_)
            | Self::Channel(_) => ErrorKind::Transfer,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// A specialized `Result` type for video-dl operations.
pub type Result<T> = std::result::Result<T, Error>;
