//! Session journal persistence for reattachment.
//!
//! The journal records every transfer a session starts and keeps terminal
//! outcomes nobody has collected yet, so a relaunched process can learn
//! what happened while it was gone.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::{SessionId, TransferEvent, TransferHandle};
use crate::store::sanitize_title;

/// What is known about a journaled transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    /// Started and not yet finished.
    Running,
    /// Finished; the artifact has not been collected.
    Finished { artifact: PathBuf },
    /// Failed; the failure has not been collected.
    Failed { error: String },
}

/// A transfer entry in the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub source: String,
    pub started: DateTime<Utc>,
    pub outcome: TransferOutcome,
}

impl JournalEntry {
    /// Rebuilds the handle this entry was written for.
    ///
    /// Returns `None` if the stored source no longer parses.
    #[must_use]
    pub fn handle(&self) -> Option<TransferHandle> {
        let source = Url::parse(&self.source).ok()?;
        Some(TransferHandle::with_id(self.id.clone(), source))
    }

    /// Converts a collected outcome into the event it stands for.
    #[must_use]
    pub fn into_event(self) -> Option<TransferEvent> {
        let handle = self.handle()?;
        match self.outcome {
            TransferOutcome::Running => None,
            TransferOutcome::Finished { artifact } => {
                Some(TransferEvent::Success { handle, artifact })
            }
            TransferOutcome::Failed { error } => Some(TransferEvent::Failure { handle, error }),
        }
    }
}

/// Persistent state of one background session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionJournal {
    pub session: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub transfers: Vec<JournalEntry>,
    #[serde(skip)]
    path: PathBuf,
}

impl SessionJournal {
    /// Creates an empty journal for `session` stored under `dir`.
    #[must_use]
    pub fn new(dir: &Path, session: &SessionId) -> Self {
        Self {
            session: session.as_str().to_string(),
            created: Utc::now(),
            transfers: Vec::new(),
            path: Self::path_for(dir, session),
        }
    }

    /// Returns the file path of the journal for `session` under `dir`.
    #[must_use]
    pub fn path_for(dir: &Path, session: &SessionId) -> PathBuf {
        dir.join(format!("{}.toml", sanitize_title(session.as_str())))
    }

    /// Loads the journal for `session`, or starts an empty one if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing journal cannot be read or parsed.
    pub fn open(dir: &Path, session: &SessionId) -> std::io::Result<Self> {
        let path = Self::path_for(dir, session);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::new(dir, session))
        }
    }

    /// Loads a journal from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut journal: Self = toml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        journal.path = path.to_path_buf();
        Ok(journal)
    }

    /// Saves the journal to disk atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp_path = self.path.with_extension("toml.tmp");

        let toml_str = toml::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        std::fs::write(&tmp_path, toml_str)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Session identifier this journal belongs to.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        SessionId::new(self.session.clone())
    }

    /// Location of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a newly started transfer.
    pub fn record_started(&mut self, handle: &TransferHandle) {
        self.transfers.push(JournalEntry {
            id: handle.id().to_string(),
            source: handle.source().to_string(),
            started: Utc::now(),
            outcome: TransferOutcome::Running,
        });
    }

    /// Sets the outcome of a journaled transfer. Returns false if it is unknown.
    pub fn record_outcome(&mut self, id: &str, outcome: TransferOutcome) -> bool {
        self.transfers
            .iter_mut()
            .find(|entry| entry.id == id)
            .map(|entry| entry.outcome = outcome)
            .is_some()
    }

    /// Forgets a transfer whose outcome was delivered.
    pub fn remove(&mut self, id: &str) {
        self.transfers.retain(|entry| entry.id != id);
    }

    /// Looks up a transfer by id.
    #[must_use]
    pub fn entry(&self, id: &str) -> Option<&JournalEntry> {
        self.transfers.iter().find(|entry| entry.id == id)
    }

    /// Returns the entries still marked running.
    pub fn running(&self) -> impl Iterator<Item = &JournalEntry> {
        self.transfers
            .iter()
            .filter(|entry| entry.outcome == TransferOutcome::Running)
    }

    /// Removes and returns every entry with a terminal outcome.
    pub fn take_terminal(&mut self) -> Vec<JournalEntry> {
        let (terminal, running): (Vec<_>, Vec<_>) = self
            .transfers
            .drain(..)
            .partition(|entry| entry.outcome != TransferOutcome::Running);
        self.transfers = running;
        terminal
    }
}
