use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable holding the bearer token for replay.
pub const TOKEN_ENV: &str = "OFFLINE_RELAY_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the relay fronts, e.g. https://erp.example.com
  pub origin: Url,
  /// Path prefix that marks API requests
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Cache generation; bump it to evict everything cached by older releases
  pub generation: String,
  /// App-shell paths or URLs fetched at install time
  #[serde(default)]
  pub precache: Vec<String>,
  #[serde(default = "default_install_timeout")]
  pub install_timeout_secs: u64,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
  #[serde(default)]
  pub write_failure: WriteFailurePolicy,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  /// Database location (default: $XDG_DATA_HOME/offline-relay/relay.db)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub log: LogConfig,
}

/// What the caller sees when a write is queued because the network is down.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteFailurePolicy {
  /// Resolve with a queued acknowledgement (202 Accepted)
  #[default]
  ReportQueued,
  /// Return the network error after queueing
  PropagateError,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Records older than this are dropped unreplayed. 0 keeps them forever.
  #[serde(default = "default_max_age_hours")]
  pub max_age_hours: u64,
  /// Delay before retrying a halted replay pass
  #[serde(default = "default_retry_interval")]
  pub retry_interval_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_age_hours: default_max_age_hours(),
      retry_interval_secs: default_retry_interval(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Oldest API read served while offline. 0 means no limit.
  #[serde(default = "default_api_max_age")]
  pub api_max_age_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      api_max_age_secs: default_api_max_age(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  #[serde(default = "default_probe_path")]
  pub probe_path: String,
  #[serde(default = "default_probe_interval")]
  pub interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_path: default_probe_path(),
      interval_secs: default_probe_interval(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Directory for daily rolling log files; stderr only when unset
  pub dir: Option<PathBuf>,
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_install_timeout() -> u64 {
  30
}

fn default_request_timeout() -> u64 {
  15
}

fn default_max_age_hours() -> u64 {
  24 * 7
}

fn default_retry_interval() -> u64 {
  30
}

fn default_api_max_age() -> u64 {
  300
}

fn default_probe_path() -> String {
  "/healthz".to_string()
}

fn default_probe_interval() -> u64 {
  5
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-relay.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-relay/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offline-relay/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-relay.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-relay").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;

    if config.generation.trim().is_empty() {
      return Err(eyre!("generation must not be empty"));
    }
    if !config.api_prefix.starts_with('/') {
      return Err(eyre!("api_prefix must start with '/'"));
    }

    Ok(config)
  }

  /// Precache entries resolved against the origin.
  pub fn precache_urls(&self) -> std::result::Result<Vec<Url>, url::ParseError> {
    self.precache.iter().map(|p| self.origin.join(p)).collect()
  }

  pub fn probe_url(&self) -> Result<Url> {
    self
      .origin
      .join(&self.connectivity.probe_path)
      .map_err(|e| eyre!("Bad probe path {}: {}", self.connectivity.probe_path, e))
  }

  pub fn install_timeout(&self) -> Duration {
    Duration::from_secs(self.install_timeout_secs)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn retry_interval(&self) -> Duration {
    Duration::from_secs(self.queue.retry_interval_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.connectivity.interval_secs.max(1))
  }

  pub fn queue_max_age(&self) -> Option<chrono::Duration> {
    match self.queue.max_age_hours {
      0 => None,
      h => Some(chrono::Duration::hours(h as i64)),
    }
  }

  pub fn api_max_age(&self) -> Option<chrono::Duration> {
    match self.cache.api_max_age_secs {
      0 => None,
      s => Some(chrono::Duration::seconds(s as i64)),
    }
  }

  /// Get the replay token from the environment. Never read from or written
  /// to disk.
  pub fn get_api_token() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("origin: https://erp.test\ngeneration: v3\n").unwrap();
    assert_eq!(config.api_prefix, "/api/");
    assert_eq!(config.write_failure, WriteFailurePolicy::ReportQueued);
    assert_eq!(config.queue_max_age(), Some(chrono::Duration::hours(168)));
    assert_eq!(config.install_timeout(), Duration::from_secs(30));
    assert_eq!(config.probe_url().unwrap().as_str(), "https://erp.test/healthz");
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
origin: https://erp.test/
generation: "2024-06-01"
precache: ["/", "/static/app.js"]
write_failure: propagate_error
queue:
  max_age_hours: 0
  retry_interval_secs: 5
cache:
  api_max_age_secs: 0
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.write_failure, WriteFailurePolicy::PropagateError);
    assert_eq!(config.queue_max_age(), None);
    assert_eq!(config.api_max_age(), None);
    assert_eq!(config.retry_interval(), Duration::from_secs(5));
    let urls: Vec<_> = config
      .precache_urls()
      .unwrap()
      .into_iter()
      .map(|u| u.to_string())
      .collect();
    assert_eq!(urls, vec!["https://erp.test/", "https://erp.test/static/app.js"]);
  }

  #[test]
  fn test_rejects_empty_generation() {
    assert!(Config::parse("origin: https://erp.test\ngeneration: ''\n").is_err());
  }

  #[test]
  fn test_rejects_relative_api_prefix() {
    assert!(Config::parse("origin: https://erp.test\ngeneration: v1\napi_prefix: api\n").is_err());
  }
}
