use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::RetryPolicy;
use crate::cache::{PathMatcher, PolicyTable};

/// Environment variable overriding `api.base_url`.
pub const BASE_URL_ENV: &str = "STOREFRONT_API_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Per-request timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8080/api".to_string(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// When false reads are still coalesced but never stored
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: u64,
  #[serde(default = "default_timeout_retries")]
  pub timeout_retries: u32,
  #[serde(default = "default_retry_delay_ms")]
  pub retry_delay_ms: u64,
  /// Replaces the built-in policy table when present
  #[serde(default)]
  pub rules: Option<Vec<RuleConfig>>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      default_ttl_secs: default_ttl_secs(),
      timeout_retries: default_timeout_retries(),
      retry_delay_ms: default_retry_delay_ms(),
      rules: None,
    }
  }
}

/// One policy rule. Exactly one of `exact`, `prefix` or `pattern` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
  pub exact: Option<String>,
  pub prefix: Option<String>,
  pub pattern: Option<String>,
  pub ttl_secs: u64,
}

impl RuleConfig {
  fn matcher(&self) -> Result<PathMatcher> {
    match (&self.exact, &self.prefix, &self.pattern) {
      (Some(p), None, None) => Ok(PathMatcher::Exact(p.clone())),
      (None, Some(p), None) => Ok(PathMatcher::Prefix(p.clone())),
      (None, None, Some(p)) => Regex::new(p)
        .map(PathMatcher::Pattern)
        .map_err(|e| eyre!("Invalid cache rule pattern '{}': {}", p, e)),
      _ => Err(eyre!(
        "Cache rule must set exactly one of exact, prefix or pattern"
      )),
    }
  }
}

impl CacheConfig {
  /// Build the policy table. Rules keep their file order; the first match wins.
  pub fn policy(&self) -> Result<PolicyTable> {
    let default_ttl = Duration::from_secs(self.default_ttl_secs);

    match &self.rules {
      None => Ok(PolicyTable::storefront().with_default_ttl(default_ttl)),
      Some(rules) => rules.iter().try_fold(PolicyTable::new(default_ttl), |table, rule| {
        Ok(table.rule(rule.matcher()?, Duration::from_secs(rule.ttl_secs)))
      }),
    }
  }

  pub fn retry(&self) -> RetryPolicy {
    RetryPolicy {
      timeout_retries: self.timeout_retries,
      delay: Duration::from_millis(self.retry_delay_ms),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_ttl_secs() -> u64 {
  300
}

fn default_timeout_retries() -> u32 {
  2
}

fn default_retry_delay_ms() -> u64 {
  200
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storefront-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront-cache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found. The
  /// `STOREFRONT_API_URL` environment variable overrides the base URL.
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

    if let Ok(url) = std::env::var(BASE_URL_ENV) {
      config.api.base_url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("storefront-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.cache.policy()?;
    Ok(config)
  }
}
