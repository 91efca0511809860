//! Items, snapshots and notices published by the coordinator.

use std::fmt;

use reqwest::Url;

/// Stable identity of a registered item (its position in the registration list).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(String);

impl ItemId {
    /// Identity for the entry at `index` of a registration list.
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self(index.to_string())
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<usize> for ItemId {
    fn from(index: usize) -> Self {
        Self::from_index(index)
    }
}

/// Download state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemState {
    /// Nothing downloaded and no transfer running.
    #[default]
    Idle,
    /// A transfer is running for this item.
    InProgress,
    /// The artifact is in the local store.
    Completed,
    /// The last attempt failed; a new request retries.
    Failed,
}

impl ItemState {
    /// Returns true if no transfer is running or pending for the item.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// A tracked video.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Identity assigned at registration.
    pub id: ItemId,
    /// Human-readable label, also the key for the local artifact name.
    pub title: String,
    /// Sanitized transfer source.
    pub source: Url,
    /// Whether the local store holds a finished artifact for this item.
    pub local_presence: bool,
    /// Current state.
    pub state: ItemState,
    /// Fraction of the current attempt that has been transferred, in `[0.0, 1.0]`.
    pub progress_fraction: f64,
    /// Set while the engine cannot report a total size for the current attempt.
    pub indeterminate: bool,
    /// Cumulative bytes reported for the current attempt.
    pub bytes_written: u64,
}

impl Item {
    /// Creates an idle item with the placeholder title for `index`.
    #[must_use]
    pub fn new(index: usize, source: Url) -> Self {
        Self {
            id: ItemId::from_index(index),
            title: placeholder_title(index),
            source,
            local_presence: false,
            state: ItemState::Idle,
            progress_fraction: 0.0,
            indeterminate: false,
            bytes_written: 0,
        }
    }

    /// Starts a fresh attempt.
    pub fn begin_attempt(&mut self) {
        self.state = ItemState::InProgress;
        self.clear_progress();
    }

    /// Applies a cumulative progress report from the engine.
    ///
    /// The fraction never decreases within an attempt. Without a known
    /// total the fraction is left alone and the item is flagged
    /// indeterminate.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_progress(&mut self, written: u64, total: Option<u64>) {
        if self.state != ItemState::InProgress {
            return;
        }
        self.bytes_written = self.bytes_written.max(written);
        match total {
            Some(total) if total > 0 => {
                let fraction = (written as f64 / total as f64).clamp(0.0, 1.0);
                self.progress_fraction = self.progress_fraction.max(fraction);
                self.indeterminate = false;
            }
            _ => self.indeterminate = true,
        }
    }

    /// Marks the artifact as committed.
    pub fn mark_completed(&mut self) {
        self.state = ItemState::Completed;
        self.local_presence = true;
        self.progress_fraction = 1.0;
        self.indeterminate = false;
    }

    /// Marks the current attempt as failed.
    pub fn mark_failed(&mut self) {
        self.state = ItemState::Failed;
        self.clear_progress();
    }

    /// Returns the item to idle after its artifact was deleted.
    pub fn reset(&mut self) {
        self.state = ItemState::Idle;
        self.local_presence = false;
        self.clear_progress();
    }

    fn clear_progress(&mut self) {
        self.progress_fraction = 0.0;
        self.indeterminate = false;
        self.bytes_written = 0;
    }
}

/// Placeholder title used until real metadata is known.
#[must_use]
pub fn placeholder_title(index: usize) -> String {
    format!("Video {index}")
}

/// An immutable view of every registered item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Incremented once per registration call.
    pub generation: u64,
    /// Incremented once per published batch.
    pub revision: u64,
    /// Items in registration order.
    pub items: Vec<Item>,
    /// Number of transfers the coordinator currently tracks.
    pub active_transfers: usize,
}

impl Snapshot {
    /// Looks up an item by identity.
    #[must_use]
    pub fn item(&self, id: &ItemId) -> Option<&Item> {
        self.items.iter().find(|item| &item.id == id)
    }

    /// Returns true if no item has a running transfer.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.items.iter().all(|item| item.state.is_settled())
    }
}

/// Category of a failure reported on the notice channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network unavailable or lost.
    Connectivity,
    /// Transfer failure, timeout or cancellation.
    Transfer,
    /// Local store commit or removal failure.
    Storage,
    /// Malformed registration entry.
    Validation,
}

/// A notable event for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Something worth telling the user that is not a failure.
    Info {
        /// Item the notice is about, if any.
        item: Option<ItemId>,
        /// Display text.
        message: String,
    },
    /// A failure, always paired with a well-defined item state.
    Error {
        /// Item the notice is about, if any.
        item: Option<ItemId>,
        /// Failure category.
        kind: ErrorKind,
        /// Display text.
        message: String,
    },
}

impl Notice {
    /// Builds an informational notice.
    pub fn info(item: Option<ItemId>, message: impl Into<String>) -> Self {
        Self::Info {
            item,
            message: message.into(),
        }
    }

    /// Builds an error notice.
    pub fn error(item: Option<ItemId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            item,
            kind,
            message: message.into(),
        }
    }

    /// Returns the display text.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Info { message, .. } | Self::Error { message, .. } => message,
        }
    }

    /// Item the notice is about, if any.
    #[must_use]
    pub const fn item(&self) -> Option<&ItemId> {
        match self {
            Self::Info { item, .. } | Self::Error { item, .. } => item.as_ref(),
        }
    }

    /// Returns true for failure notices.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
