//! Daemon configuration, read from `.sourcetags.toml` in the project root.
//!
//! Every key is optional:
//!
//! ```toml
//! pid_file = ".ct.pid"
//! socket_file = ".ct.sock"
//! database = ".ct.sqlite"
//! poll_interval_ms = 1000
//! prune_watches = true
//! watch = true
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TagsError};

pub const CONFIG_FILE: &str = ".sourcetags.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub pid_file: PathBuf,
    pub socket_file: PathBuf,
    pub database: PathBuf,
    /// Bound on every background wait, hence on shutdown latency.
    pub poll_interval_ms: u64,
    /// Unwatch files that dropped out of the index on rescan.
    pub prune_watches: bool,
    pub watch: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from(".ct.pid"),
            socket_file: PathBuf::from(".ct.sock"),
            database: PathBuf::from(".ct.sqlite"),
            poll_interval_ms: 1000,
            prune_watches: true,
            watch: true,
        }
    }
}

impl DaemonConfig {
    /// Loads `<root>/.sourcetags.toml`, or the defaults when it does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        Self::load_from(&root.join(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TagsError::Config(format!("{}: {e}", path.display())))?;
        if config.poll_interval_ms == 0 {
            return Err(TagsError::Config(format!(
                "{}: poll_interval_ms must be positive",
                path.display()
            )));
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolves the configured file paths against `root`.
    pub fn resolve(&self, root: &Path) -> Self {
        Self {
            pid_file: root.join(&self.pid_file),
            socket_file: root.join(&self.socket_file),
            database: root.join(&self.database),
            ..self.clone()
        }
    }
}
