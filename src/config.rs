use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use userdeck::prefetch::PrefetchConfig;
use userdeck::SessionOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub prefetch: PrefetchSettings,
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  #[serde(default = "default_search_debounce_ms")]
  pub search_debounce_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the users API (e.g., "https://admin.example.com/api/")
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Seconds a page stays fresh; older pages are served while revalidating
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  /// Keep the cache in SQLite across runs
  #[serde(default)]
  pub persist: bool,
  /// Database location when persisting (defaults to the data directory)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
      persist: false,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrefetchSettings {
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default = "default_stagger_ms")]
  pub stagger_ms: u64,
  #[serde(default = "default_max_pages")]
  pub max_pages: u32,
}

impl Default for PrefetchSettings {
  fn default() -> Self {
    Self {
      enabled: true,
      stagger_ms: default_stagger_ms(),
      max_pages: default_max_pages(),
    }
  }
}

fn default_ttl_secs() -> u64 {
  300
}

fn default_true() -> bool {
  true
}

fn default_stagger_ms() -> u64 {
  150
}

fn default_max_pages() -> u32 {
  50
}

fn default_request_timeout_secs() -> u64 {
  15
}

fn default_page_size() -> u32 {
  20
}

fn default_search_debounce_ms() -> u64 {
  300
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./userdeck.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/userdeck/config.yaml
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
        "No configuration file found. Create one at ~/.config/userdeck/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("userdeck.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("userdeck").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    url::Url::parse(&self.api.url).map_err(|e| eyre!("api.url '{}': {}", self.api.url, e))?;
    if self.page_size == 0 {
      return Err(eyre!("page_size must be positive"));
    }
    Ok(())
  }

  /// Get the API token from the environment, if set.
  ///
  /// Checks USERDECK_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("USERDECK_API_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }

  pub fn ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.cache.ttl_secs as i64)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn session_options(&self) -> SessionOptions {
    SessionOptions {
      page_size: self.page_size,
      request_timeout: self.request_timeout(),
      search_debounce: Duration::from_millis(self.search_debounce_ms),
      prefetch: PrefetchConfig {
        enabled: self.prefetch.enabled,
        stagger: Duration::from_millis(self.prefetch.stagger_ms),
        max_pages: self.prefetch.max_pages,
      },
    }
  }
}
