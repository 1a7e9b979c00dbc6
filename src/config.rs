use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::{CacheConfig, PersistOptions, RefetchOnMount};
use crate::freshness::FreshnessConfig;

/// Environment variable that overrides `api.url`.
pub const API_URL_ENV: &str = "DFIP_API_URL";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheSettings,
  #[serde(default)]
  pub freshness: FreshnessSettings,
  /// Items per page for paginated lists
  #[serde(default = "default_page_size")]
  pub page_size: u32,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      api: ApiConfig::default(),
      cache: CacheSettings::default(),
      freshness: FreshnessSettings::default(),
      page_size: default_page_size(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  #[serde(default = "default_api_url")]
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: default_api_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  pub stale_minutes: i64,
  pub gc_minutes: i64,
  pub retry: u32,
  pub retry_delay_ms: u64,
  /// Refetch fresh entries when a consumer mounts: `if_stale` or `always`
  pub refetch_on_mount: RefetchOnMount,
  /// Persist the cache across runs
  pub persist: bool,
  pub max_age_minutes: i64,
  /// Bump to discard every persisted cache
  pub buster: String,
  pub storage_key: String,
}

impl Default for CacheSettings {
  fn default() -> Self {
    let persist = PersistOptions::default();
    Self {
      stale_minutes: 10,
      gc_minutes: 30,
      retry: 2,
      retry_delay_ms: 1000,
      refetch_on_mount: RefetchOnMount::IfStale,
      persist: true,
      max_age_minutes: persist.max_age.num_minutes(),
      buster: persist.buster,
      storage_key: persist.storage_key,
    }
  }
}

impl CacheSettings {
  pub fn cache_config(&self) -> CacheConfig {
    CacheConfig {
      stale_time: Duration::minutes(self.stale_minutes),
      gc_time: Duration::minutes(self.gc_minutes),
      retry: self.retry,
      retry_delay: std::time::Duration::from_millis(self.retry_delay_ms),
      refetch_on_mount: self.refetch_on_mount,
    }
  }

  pub fn persist_options(&self) -> PersistOptions {
    PersistOptions {
      storage_key: self.storage_key.clone(),
      buster: self.buster.clone(),
      max_age: Duration::minutes(self.max_age_minutes),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FreshnessSettings {
  pub check_interval_secs: u64,
  pub threshold_secs: i64,
}

impl Default for FreshnessSettings {
  fn default() -> Self {
    Self {
      check_interval_secs: 300,
      threshold_secs: 600,
    }
  }
}

impl FreshnessSettings {
  pub fn freshness_config(&self) -> FreshnessConfig {
    FreshnessConfig {
      check_interval: std::time::Duration::from_secs(self.check_interval_secs),
      threshold: Duration::seconds(self.threshold_secs),
      ..Default::default()
    }
  }
}

fn default_api_url() -> String {
  "http://localhost:8000".to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_page_size() -> u32 {
  20
}

impl Config {
  /// Load configuration.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./dfip.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/dfip/config.yaml
  ///
  /// Without a file the defaults are used. `DFIP_API_URL` overrides the API
  /// URL either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(url) = std::env::var(API_URL_ENV) {
      if !url.is_empty() {
        config.api.url = url;
      }
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("dfip.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("dfip").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse YAML configuration text.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Reject values that would stall or panic the background tasks.
  fn validate(&self) -> Result<()> {
    if self.page_size == 0 {
      return Err(eyre!("page_size must be at least 1"));
    }
    if self.api.timeout_secs == 0 {
      return Err(eyre!("api.timeout_secs must be at least 1"));
    }
    if self.cache.stale_minutes < 0 {
      return Err(eyre!("cache.stale_minutes must not be negative"));
    }
    if self.cache.gc_minutes <= 0 {
      return Err(eyre!("cache.gc_minutes must be at least 1"));
    }
    if self.cache.max_age_minutes <= 0 {
      return Err(eyre!("cache.max_age_minutes must be at least 1"));
    }
    if self.freshness.check_interval_secs == 0 {
      return Err(eyre!("freshness.check_interval_secs must be at least 1"));
    }
    if self.freshness.threshold_secs < 0 {
      return Err(eyre!("freshness.threshold_secs must not be negative"));
    }
    Ok(())
  }
}
