use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::DEFAULT_PAGE_LIMIT;

pub const CONFIG_FILENAME: &str = "sensor2store.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity this process uploads as.
    pub device_id: Option<String>,
    pub topic: String,
    pub pending_dir: PathBuf,
    pub database_path: PathBuf,
    /// Largest page a single store sub-query returns.
    pub page_limit: usize,
    pub publish_timeout_secs: u64,
    /// Receiver base URL used by `upload` and `flush`.
    pub endpoint: String,
    /// Address `serve` listens on.
    pub listen_addr: String,
    /// Keep an in-process latest-value cache in front of the database.
    pub cache: bool,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sensor2store")
}

impl Default for Config {
    fn default() -> Self {
        let data = data_dir();
        Self {
            device_id: None,
            topic: "measurements".to_string(),
            pending_dir: data.join("pending"),
            database_path: data.join("measurements.db"),
            page_limit: DEFAULT_PAGE_LIMIT,
            publish_timeout_secs: 5,
            endpoint: "http://127.0.0.1:8080".to_string(),
            listen_addr: "127.0.0.1:8080".to_string(),
            cache: true,
        }
    }
}

impl Config {
    /// Load from `path`, or from `sensor2store.toml` in the working directory. A missing default
    /// file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => load_config_from_path(path),
            None if Path::new(CONFIG_FILENAME).exists() => load_config_from_path(CONFIG_FILENAME),
            None => Ok(Self::default()),
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?;
    Ok(config)
}
