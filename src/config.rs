use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::outbox::OutboxConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheSettings,
  pub outbox: OutboxSettings,
  pub connectivity: ConnectivitySettings,
  pub storage: StorageSettings,
  /// Operation type to the request that applies it
  pub routes: BTreeMap<String, Route>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  /// Path probed to decide whether the API is reachable
  pub health_path: String,
  /// Per-request timeout
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8080".to_string(),
      health_path: "/health".to_string(),
      timeout_secs: 10,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  pub ttl_secs: u64,
  pub max_entries: usize,
  pub pending_timeout_secs: u64,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      ttl_secs: 300,
      max_entries: 100,
      pending_timeout_secs: 30,
    }
  }
}

impl CacheSettings {
  pub fn to_cache_config(&self) -> CacheConfig {
    CacheConfig {
      default_ttl: Duration::from_secs(self.ttl_secs),
      max_entries: self.max_entries,
      pending_timeout: Duration::from_secs(self.pending_timeout_secs),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
  pub max_retries: u32,
  /// Stop draining at the first failure instead of skipping past it
  pub stop_on_failure: bool,
  pub max_dead_letters: usize,
}

impl Default for OutboxSettings {
  fn default() -> Self {
    Self {
      max_retries: 3,
      stop_on_failure: true,
      max_dead_letters: 100,
    }
  }
}

impl OutboxSettings {
  pub fn to_outbox_config(&self) -> OutboxConfig {
    OutboxConfig {
      max_retries: self.max_retries,
      stop_on_failure: self.stop_on_failure,
      max_dead_letters: self.max_dead_letters,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivitySettings {
  pub probe_interval_secs: u64,
}

impl Default for ConnectivitySettings {
  fn default() -> Self {
    Self {
      probe_interval_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
  /// Database file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
}

/// The request an operation type is replayed as.
#[derive(Debug, Clone, Deserialize)]
pub struct Route {
  /// HTTP method, case-insensitive in the file (defaults to POST)
  #[serde(default = "default_method", deserialize_with = "deserialize_uppercase")]
  pub method: String,
  /// Path relative to `api.base_url`
  pub path: String,
}

fn default_method() -> String {
  "POST".to_string()
}

fn deserialize_uppercase<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let s = String::deserialize(deserializer)?;
  Ok(s.to_uppercase())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }
}
