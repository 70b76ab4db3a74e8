use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database path (defaults to <data_dir>/synckit/offline.db if not set)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Maximum number of cache entries before LRU eviction kicks in
  #[serde(default = "default_cache_max_size")]
  pub max_size: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_size: default_cache_max_size(),
    }
  }
}

fn default_cache_max_size() -> usize {
  500
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// First retry delay; doubles per attempt
  #[serde(default = "default_base_delay_ms")]
  pub base_delay_ms: u64,
  /// Ceiling for the retry delay
  #[serde(default = "default_max_delay_ms")]
  pub max_delay_ms: u64,
  /// Retry ceiling applied when enqueue does not override it
  #[serde(default = "default_max_retries")]
  pub default_max_retries: u32,
  /// Period of the safety-net drain timer
  #[serde(default = "default_drain_interval_ms")]
  pub drain_interval_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: default_base_delay_ms(),
      max_delay_ms: default_max_delay_ms(),
      default_max_retries: default_max_retries(),
      drain_interval_ms: default_drain_interval_ms(),
    }
  }
}

fn default_base_delay_ms() -> u64 {
  1000
}

fn default_max_delay_ms() -> u64 {
  30_000
}

fn default_max_retries() -> u32 {
  5
}

fn default_drain_interval_ms() -> u64 {
  30_000
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./synckit.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/synckit/config.yaml
  ///
  /// Unlike an application binary, the library runs fine unconfigured:
  /// when no file is found, built-in defaults apply.
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

  /// Parse configuration from a YAML string.
  pub fn from_yaml_str(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("synckit.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("synckit").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}
