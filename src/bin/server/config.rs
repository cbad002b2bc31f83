//! Server configuration.

use anyhow::Result;
use chatd::constants::{DEFAULT_PORT, MAX_CONTENT_LEN};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port to listen on
    pub port: u16,

    /// Address to bind the listener to
    pub bind_addr: String,

    /// Maximum number of simultaneously open connections
    pub max_connections: usize,

    /// Directory holding the account file and the message log
    pub data_dir: PathBuf,

    /// Account file name, relative to `data_dir`
    pub account_file: String,

    /// Message log file name, relative to `data_dir`
    pub message_file: String,

    /// Largest accepted frame body in bytes
    pub max_frame_len: usize,

    /// Longest accepted message content, in characters
    pub max_content_len: usize,

    /// Pending friend requests a user can hold
    pub max_pending_requests: usize,

    /// Messages kept in a group's in-memory log
    pub group_message_capacity: usize,

    /// Entries returned by a chat history request
    pub history_limit: usize,

    /// Entries returned by a history search
    pub search_limit: usize,

    /// Message log lines inspected when alerting recent chat partners
    pub recent_chatter_scan: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addr: "0.0.0.0".to_string(),
            max_connections: 1024,
            data_dir: PathBuf::from("data"),
            account_file: "account.txt".to_string(),
            message_file: "messages.txt".to_string(),
            max_frame_len: 64 * 1024,
            max_content_len: MAX_CONTENT_LEN,
            max_pending_requests: 100,
            group_message_capacity: 1000,
            history_limit: 20,
            search_limit: 10,
            recent_chatter_scan: 100,
        }
    }
}

impl Config {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from `CHATD_CONFIG` (default `chatd.toml`), then apply the
    /// `CHATD_PORT` and `CHATD_DATA_DIR` overrides.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("CHATD_CONFIG").unwrap_or_else(|_| "chatd.toml".to_string());
        let mut config = Self::load_or_default(path)?;

        if let Ok(port) = std::env::var("CHATD_PORT") {
            config.port = port.parse()?;
        }
        if let Ok(dir) = std::env::var("CHATD_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn account_path(&self) -> PathBuf {
        self.data_dir.join(&self.account_file)
    }

    pub fn message_path(&self) -> PathBuf {
        self.data_dir.join(&self.message_file)
    }
}
