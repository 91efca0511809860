//! video-dl - background video downloads with consistent, observable state.
//!
//! A [`Coordinator`] owns a list of videos and drives each one through
//! idle, downloading, downloaded and failed. Transfers run in a
//! [`TransferEngine`], finished files are placed by a [`LocalStore`], and
//! losing the network (as seen by a [`ConnectivityMonitor`]) cancels
//! everything in flight.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use video_dl::{
//!     AppConfig, ConnectivityMonitor, Coordinator, HttpTransferEngine, ItemId, LocalStore,
//!     TcpProbe,
//! };
//!
//! # async fn example() -> video_dl::Result<()> {
//! let config = AppConfig::default();
//! let probe = TcpProbe::new(
//!     config.connectivity.probe_targets.clone(),
//!     config.connectivity.probe_timeout(),
//! );
//! let monitor = ConnectivityMonitor::spawn(probe, config.connectivity.probe_interval()).await;
//! let engine = Arc::new(HttpTransferEngine::new(&config)?);
//! let store = LocalStore::new(&config.paths.download_dir, "mp4");
//!
//! let coordinator = Coordinator::spawn(&config, engine, store, monitor.subscribe()).await?;
//! coordinator
//!     .configure(["https://example.com/a.mp4", "https://example.com/b.mp4"])
//!     .await?;
//! coordinator.request(&ItemId::from("0")).await?;
//!
//! let mut updates = coordinator.subscribe();
//! updates.wait_for(|snapshot| snapshot.is_settled()).await.ok();
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod fs;
pub mod model;
pub mod store;
pub mod transfer;
pub mod url;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::AppConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityProbe, ConnectivityStatus, TcpProbe};
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use error::{Error, Result};
pub use format::{format_bytes, format_duration, format_percent};
pub use fs::{FileSystem, TokioFileSystem};
pub use model::{ErrorKind, Item, ItemId, ItemState, Notice, Snapshot};
pub use store::LocalStore;
pub use transfer::{
    Attachment, HttpTransferEngine, SessionId, TransferEngine, TransferEvent, TransferHandle,
};
pub use url::{parse_source, sanitize_source};
