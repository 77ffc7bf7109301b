//! Subscriber configuration
//!
//! Read from a TOML file; every field has a default so an empty file (or no
//! file at all) yields a working cache-only subscriber.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Broker base URL (`http://host:port`); `None` runs without a feed.
    pub broker: Option<String>,
    /// Chunk store directory (`<cache_dir>/<root>/<path>`).
    pub cache_dir: PathBuf,
    /// Directory holding the etag and root tables.
    pub state_dir: PathBuf,
    /// Whole-request timeout for publisher and broker HTTP calls.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Bounded wait for the feed to close on shutdown.
    pub feed_disconnect_timeout_secs: u64,
    /// Listen address of the read API.
    pub listen: String,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            broker: None,
            cache_dir: PathBuf::from("dshare-cache"),
            state_dir: PathBuf::from("dshare-state"),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            feed_disconnect_timeout_secs: 5,
            listen: "127.0.0.1:8001".to_string(),
        }
    }
}

impl SubscriberConfig {
    /// Load from a TOML file; a missing file gives the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn feed_disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_disconnect_timeout_secs)
    }

    pub fn etag_file(&self) -> PathBuf {
        self.state_dir.join("etags.json")
    }

    pub fn root_file(&self) -> PathBuf {
        self.state_dir.join("roots.json")
    }
}
