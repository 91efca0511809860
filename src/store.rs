//! Local store for finished artifacts.
//!
//! Every item's artifact lives at a path derived purely from its title, so
//! the store needs no index of its own: existence on disk is the record.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::fs::{FileSystem, TokioFileSystem};

static UNSAFE_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("valid regex"));

/// Turns a title into a file stem containing only `[a-zA-Z0-9_-]`.
#[must_use]
pub fn sanitize_title(title: &str) -> String {
    let stem = UNSAFE_CHARS_RE.replace_all(title, "_");
    if stem.is_empty() {
        "untitled".to_string()
    } else {
        stem.into_owned()
    }
}

/// Returns the `.part` staging path used when a commit has to copy.
fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Document store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct LocalStore<F: FileSystem = TokioFileSystem> {
    root: PathBuf,
    extension: String,
    fs: F,
}

impl LocalStore<TokioFileSystem> {
    /// Creates a store on the real file system.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self::with_fs(root, extension, TokioFileSystem)
    }
}

impl<F: FileSystem> LocalStore<F> {
    /// Creates a store with a custom file system implementation.
    #[must_use]
    pub fn with_fs(root: impl Into<PathBuf>, extension: impl Into<String>, fs: F) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            fs,
        }
    }

    /// Directory holding the artifacts.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the artifact for `title`. Same title, same path.
    #[must_use]
    pub fn deterministic_path(&self, title: &str) -> PathBuf {
        let stem = sanitize_title(title);
        if self.extension.is_empty() {
            self.root.join(stem)
        } else {
            self.root.join(format!("{stem}.{}", self.extension))
        }
    }

    /// Returns true if a file exists at `path`.
    pub async fn exists(&self, path: &Path) -> bool {
        self.fs.file_exists(path).await
    }

    /// Moves a finished temporary artifact to `path`, replacing what is there.
    ///
    /// The replacement is a single rename when `artifact` and `path` share a
    /// file system. Otherwise the artifact is copied next to `path` as
    /// `.part` first and then renamed over it. Either way the previous file
    /// is untouched until the final rename succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the destination directory cannot be
    /// created or the artifact cannot be moved into place.
    pub async fn commit(&self, artifact: &Path, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.fs
                .create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(parent, e))?;
        }

        match self.fs.rename_file(artifact, path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                log::debug!(
                    "{} is on another device, committing by copy",
                    artifact.display()
                );
                self.commit_by_copy(artifact, path).await
            }
            Err(e) => Err(Error::storage(path, e)),
        }
    }

    async fn commit_by_copy(&self, artifact: &Path, path: &Path) -> Result<()> {
        let pp = part_path(path);
        if let Err(e) = self.fs.copy_file(artifact, &pp).await {
            let _ = self.fs.remove_file(&pp).await;
            return Err(Error::storage(path, e));
        }
        if let Err(e) = self.fs.rename_file(&pp, path).await {
            let _ = self.fs.remove_file(&pp).await;
            return Err(Error::storage(path, e));
        }
        if let Err(e) = self.fs.remove_file(artifact).await {
            log::warn!("Could not remove staged artifact {}: {e}", artifact.display());
        }
        Ok(())
    }

    /// Deletes the artifact at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if nothing exists at `path` or removal fails.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        if !self.fs.file_exists(path).await {
            return Err(Error::storage(
                path,
                io::Error::new(io::ErrorKind::NotFound, "no artifact at this path"),
            ));
        }
        self.fs
            .remove_file(path)
            .await
            .map_err(|e| Error::storage(path, e))
    }

    /// Throws away a staged artifact that will never be committed.
    ///
    /// An artifact that is already gone counts as discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists but cannot be removed.
    pub async fn discard(&self, artifact: &Path) -> Result<()> {
        match self.fs.remove_file(artifact).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(artifact, e)),
        }
    }
}
