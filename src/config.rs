//! Configuration types and TOML persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default background session identifier.
pub const DEFAULT_SESSION: &str = "video-dl.background";

/// Directories used by the store, the engine and the session journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Directory where finished videos are kept.
    pub download_dir: PathBuf,
    /// Directory for in-flight temporary artifacts.
    pub staging_dir: PathBuf,
    /// Directory for session journals.
    pub state_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("video-dl");
        let download_dir = dirs::video_dir()
            .map_or_else(|| PathBuf::from("downloads"), |d| d.join("video-dl"));

        Self {
            download_dir,
            staging_dir: data_dir.join("staging"),
            state_dir: data_dir.join("sessions"),
        }
    }
}

/// HTTP transfer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Seconds allowed to establish a connection.
    pub connect_timeout_secs: u64,
    /// Seconds a transfer may stall without receiving data.
    pub read_timeout_secs: u64,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Whether to delete partial files when a transfer fails.
    pub cleanup_on_error: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            read_timeout_secs: 60,
            user_agent: concat!("video-dl/", env!("CARGO_PKG_VERSION")).to_string(),
            cleanup_on_error: true,
        }
    }
}

impl TransferConfig {
    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read timeout as a [`Duration`].
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Reachability probing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// `host:port` targets; the network is up if any of them accepts a connection.
    pub probe_targets: Vec<String>,
    /// Milliseconds between probes.
    pub probe_interval_ms: u64,
    /// Milliseconds before a probe attempt is abandoned.
    pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_targets: vec!["1.1.1.1:443".to_string(), "8.8.8.8:53".to_string()],
            probe_interval_ms: 2000,
            probe_timeout_ms: 1500,
        }
    }
}

impl ConnectivityConfig {
    /// Probe interval as a [`Duration`].
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Probe timeout as a [`Duration`].
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Local store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Extension appended to every artifact name.
    pub file_extension: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            file_extension: "mp4".to_string(),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Background session the engine attaches to at startup.
    pub session: String,
    /// Directory configuration.
    pub paths: PathConfig,
    /// Transfer configuration.
    pub transfer: TransferConfig,
    /// Connectivity configuration.
    pub connectivity: ConnectivityConfig,
    /// Store configuration.
    pub store: StoreConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: DEFAULT_SESSION.to_string(),
            paths: PathConfig::default(),
            transfer: TransferConfig::default(),
            connectivity: ConnectivityConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the background session identifier.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    /// Sets the download directory.
    #[must_use]
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths.download_dir = dir.into();
        self
    }

    /// Sets the staging directory.
    #[must_use]
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths.staging_dir = dir.into();
        self
    }

    /// Sets the session journal directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths.state_dir = dir.into();
        self
    }

    /// Places download, staging and state directories under one root.
    #[must_use]
    pub fn with_root_dir(self, root: &Path) -> Self {
        self.with_download_dir(root.join("videos"))
            .with_staging_dir(root.join("staging"))
            .with_state_dir(root.join("sessions"))
    }

    /// Sets whether partial files are deleted on failure.
    #[must_use]
    pub const fn with_cleanup_on_error(mut self, cleanup: bool) -> Self {
        self.transfer.cleanup_on_error = cleanup;
        self
    }

    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("video-dl")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Loads configuration, writing the defaults to `path` first if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, read or parsed.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        log::info!("Wrote default configuration to {}", path.display());
        Ok(config)
    }

    /// Saves the configuration atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml::to_string_pretty(self)?)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
