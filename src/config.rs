use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the proxy forwards to and the worker controls
  pub upstream: String,
  #[serde(default = "default_listen")]
  pub listen: String,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub log: LogConfig,
}

fn default_listen() -> String {
  "127.0.0.1:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Name of the cache shared by precache writes and fallback reads
  pub name: String,
  /// Paths fetched and stored at install time
  pub precache: Vec<String>,
  /// Page served when a navigation cannot reach the network
  pub offline_page: String,
  /// Regex patterns (matched against path and query) served
  /// stale-while-revalidate
  pub routes: Vec<String>,
  pub navigation_preload: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name: "engage-cache".to_string(),
      precache: vec!["/static/".to_string(), "/offline/".to_string()],
      offline_page: "/offline/".to_string(),
      routes: vec!["/*".to_string()],
      navigation_preload: true,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// SQLite database on disk
  #[default]
  Sqlite,
  /// Process memory; nothing survives a restart
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  #[serde(default)]
  pub backend: StorageBackend,
  /// Database path (default: $XDG_DATA_HOME/navcache/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Directory for daily-rolling log files, in addition to stderr
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Default configuration for an upstream origin.
  pub fn new(upstream: &str) -> Self {
    Self {
      upstream: upstream.to_string(),
      listen: default_listen(),
      cache: CacheConfig::default(),
      storage: StorageConfig::default(),
      log: LogConfig::default(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./navcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/navcache/config.yaml
  ///
  /// With no file found, an `upstream` override alone is enough to run on
  /// defaults. When both exist the override wins.
  pub fn load(explicit_path: Option<&Path>, upstream: Option<&str>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match (path, upstream) {
      (Some(p), _) => Self::load_from_path(&p)?,
      (None, Some(upstream)) => Self::new(upstream),
      (None, None) => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/navcache/config.yaml\n\
                 or pass --upstream."
        ))
      }
    };

    if let Some(upstream) = upstream {
      config.upstream = upstream.to_string();
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("navcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("navcache").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// The upstream origin as a URL.
  pub fn upstream_url(&self) -> Result<Url> {
    let url = Url::parse(&self.upstream)
      .map_err(|e| eyre!("Invalid upstream URL '{}': {}", self.upstream, e))?;

    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("Upstream must be http or https: {}", self.upstream));
    }

    Ok(url)
  }

  /// Check the invariants the worker relies on.
  pub fn validate(&self) -> Result<()> {
    self.upstream_url()?;

    if self.cache.name.trim().is_empty() {
      return Err(eyre!("cache.name must not be empty"));
    }

    // The fallback can only be served if install stored it
    if !self.cache.precache.contains(&self.cache.offline_page) {
      return Err(eyre!(
        "cache.offline_page '{}' must be listed in cache.precache",
        self.cache.offline_page
      ));
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("upstream: http://localhost:8000\n").unwrap();

    assert_eq!(config.listen, "127.0.0.1:8080");
    assert_eq!(config.cache.name, "engage-cache");
    assert_eq!(config.cache.precache, vec!["/static/", "/offline/"]);
    assert_eq!(config.cache.routes, vec!["/*"]);
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
upstream: https://engage.example.com
listen: 0.0.0.0:9000
cache:
  name: engage-v2
  precache: ["/", "/static/app.css", "/offline/"]
  routes: ["^/static/"]
  navigation_preload: false
storage:
  backend: memory
log:
  directory: /var/log/navcache
"#,
    )
    .unwrap();

    assert_eq!(config.listen, "0.0.0.0:9000");
    assert_eq!(config.cache.name, "engage-v2");
    assert_eq!(config.cache.offline_page, "/offline/");
    assert!(!config.cache.navigation_preload);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(
      config.log.directory.as_deref(),
      Some(Path::new("/var/log/navcache"))
    );
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_offline_page_must_be_precached() {
    let config = Config::parse(
      r#"
upstream: http://localhost:8000
cache:
  precache: ["/static/"]
"#,
    )
    .unwrap();

    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("must be listed in cache.precache"));
  }

  #[test]
  fn test_upstream_must_be_http() {
    assert!(Config::new("ftp://files.example.com").validate().is_err());
    assert!(Config::new("not a url").validate().is_err());
    assert!(Config::new("https://engage.example.com").validate().is_ok());
  }

  #[test]
  fn test_load_explicit_path_with_override() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "upstream: http://localhost:8000").unwrap();

    let config = Config::load(Some(file.path()), Some("http://staging.test")).unwrap();

    assert_eq!(config.upstream, "http://staging.test");
  }

  #[test]
  fn test_load_missing_explicit_path_fails() {
    let err = Config::load(Some(Path::new("/nonexistent/navcache.yaml")), None).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
