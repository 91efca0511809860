//! Transfer engine contract.
//!
//! An engine moves bytes from a source location into a temporary local
//! artifact and reports what happened as [`TransferEvent`]s on the channel
//! handed out by [`TransferEngine::attach`]. Events for one handle arrive
//! in order: any number of `Progress`, then exactly one `Success` or
//! `Failure`.

pub mod http;
pub mod journal;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::Url;
use tokio::sync::mpsc;

use crate::error::Result;

pub use http::HttpTransferEngine;
pub use journal::{JournalEntry, SessionJournal, TransferOutcome};

/// Identifier of a background transfer session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a session identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Opaque key for one transfer attempt, bound to its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    id: String,
    source: Url,
}

impl TransferHandle {
    /// Creates a handle with a fresh random id.
    #[must_use]
    pub fn new(source: Url) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), source)
    }

    /// Recreates a handle with a known id.
    #[must_use]
    pub const fn with_id(id: String, source: Url) -> Self {
        Self { id, source }
    }

    /// Unique id of this attempt.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Location the attempt reads from.
    #[must_use]
    pub const fn source(&self) -> &Url {
        &self.source
    }
}

impl fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.source)
    }
}

/// Something that happened to a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Cumulative bytes written so far; `total` is `None` when unknown.
    Progress {
        /// Transfer the report belongs to.
        handle: TransferHandle,
        /// Bytes written so far.
        written: u64,
        /// Expected size, if the server announced one.
        total: Option<u64>,
    },
    /// The transfer finished and its bytes are in `artifact`.
    Success {
        /// Transfer that finished.
        handle: TransferHandle,
        /// Temporary file holding the downloaded bytes.
        artifact: PathBuf,
    },
    /// The transfer failed, timed out or was cancelled.
    Failure {
        /// Transfer that failed.
        handle: TransferHandle,
        /// Display text of the failure.
        error: String,
    },
}

impl TransferEvent {
    /// Handle the event belongs to.
    #[must_use]
    pub const fn handle(&self) -> &TransferHandle {
        match self {
            Self::Progress { handle, .. }
            | Self::Success { handle, .. }
            | Self::Failure { handle, .. } => handle,
        }
    }

    /// Returns true for `Success` and `Failure`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Sending half of an engine event channel.
pub type EventSender = mpsc::UnboundedSender<TransferEvent>;

/// Receiving half of an engine event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<TransferEvent>;

/// Result of binding to a session.
#[derive(Debug)]
pub struct Attachment {
    /// Live events from now on.
    pub events: EventReceiver,
    /// Transfers of this session that are still running.
    pub in_flight: Vec<TransferHandle>,
    /// Terminal events that happened while nobody was attached.
    ///
    /// Each buffered event is handed out by exactly one attach call.
    pub pending: Vec<TransferEvent>,
}

/// Performs transfers on behalf of the coordinator.
#[async_trait]
pub trait TransferEngine: Send + Sync + 'static {
    /// Binds to `session`, replacing any previous binding.
    ///
    /// Events from transfers that are still running are redirected to the
    /// returned channel.
    async fn attach(&self, session: &SessionId) -> Result<Attachment>;

    /// Starts a transfer from `source` and returns its handle.
    async fn start(&self, source: &Url) -> Result<TransferHandle>;

    /// Cancels a running transfer.
    ///
    /// A cancelled transfer always ends with a `Failure` event. Unknown or
    /// finished handles are ignored.
    fn cancel(&self, handle: &TransferHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://host/a.mp4").unwrap()
    }

    #[test]
    fn handles_are_unique_per_attempt() {
        let a = TransferHandle::new(url());
        let b = TransferHandle::new(url());
        assert_ne!(a, b);
        assert_eq!(a.source(), b.source());
    }

    #[test]
    fn handle_round_trips_through_id() {
        let a = TransferHandle::new(url());
        let b = TransferHandle::with_id(a.id().to_string(), url());
        assert_eq!(a, b);
    }

    #[test]
    fn terminal_events() {
        let handle = TransferHandle::new(url());
        let progress = TransferEvent::Progress {
            handle: handle.clone(),
            written: 1,
            total: None,
        };
        let failure = TransferEvent::Failure {
            handle: handle.clone(),
            error: "boom".into(),
        };
        assert!(!progress.is_terminal());
        assert!(failure.is_terminal());
        assert_eq!(failure.handle(), &handle);
    }
}
