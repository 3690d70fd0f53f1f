use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{SqliteStorage, DEFAULT_MAX_ENTRY_BYTES};
use crate::worker::RouteConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Site the shell is served from; precache paths resolve against it
  pub origin: Url,
  #[serde(default)]
  pub environment: Environment,
  pub cache: CacheConfig,
  /// Paths fetched at install (root document, manifest, icons)
  pub precache: Vec<String>,
  /// Activate a freshly installed worker without waiting for open pages
  #[serde(default = "default_true")]
  pub skip_waiting_on_install: bool,
  /// Cache key navigations are stored under and served from when offline
  #[serde(default = "default_navigation_fallback")]
  pub navigation_fallback: String,
  /// Routing rules replacing the default table, evaluated in order
  #[serde(default)]
  pub routes: Option<Vec<RouteConfig>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Generation name; changing it invalidates everything cached before
  pub version: String,
  /// Database file (default: $XDG_DATA_HOME/offline-shell/cache.db)
  pub database: Option<PathBuf>,
  #[serde(default = "default_max_entry_bytes")]
  pub max_entry_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
  #[default]
  Production,
  /// Worker registration disabled, existing caches are cleared
  Development,
}

fn default_true() -> bool {
  true
}

fn default_navigation_fallback() -> String {
  "/index.html".to_string()
}

fn default_max_entry_bytes() -> usize {
  DEFAULT_MAX_ENTRY_BYTES
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-shell.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-shell/config.yaml
  ///
  /// `OFFLINE_SHELL_ORIGIN` overrides the configured origin.
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
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/offline-shell/config.yaml\n\
                 See demos/config.example.yaml for the format."
        ))
      }
    };

    if let Ok(origin) = std::env::var("OFFLINE_SHELL_ORIGIN") {
      config.origin = Url::parse(&origin)
        .map_err(|e| eyre!("Invalid OFFLINE_SHELL_ORIGIN '{}': {}", origin, e))?;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-shell.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-shell").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn validate(&self) -> Result<()> {
    if !matches!(self.origin.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be an http(s) URL, got {}", self.origin));
    }
    if self.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }
    if self.precache.is_empty() {
      return Err(eyre!("precache must list at least the root document"));
    }
    if let Some(path) = self.precache.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("Precache path '{}' must start with '/'", path));
    }
    if !self.navigation_fallback.starts_with('/') {
      return Err(eyre!(
        "navigation_fallback '{}' must start with '/'",
        self.navigation_fallback
      ));
    }
    let bad_fallback = self
      .routes
      .iter()
      .flatten()
      .filter_map(|route| route.fallback.as_deref())
      .find(|fallback| !fallback.starts_with('/'));
    if let Some(fallback) = bad_fallback {
      return Err(eyre!("Route fallback '{}' must start with '/'", fallback));
    }
    Ok(())
  }

  /// Same configuration for another cache version.
  pub fn with_version(&self, version: &str) -> Self {
    let mut config = self.clone();
    config.cache.version = version.to_string();
    config
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.cache.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }
}

#[cfg(test)]
pub fn test_config(origin: &str, version: &str, precache: &[&str]) -> Config {
  Config {
    origin: Url::parse(origin).expect("valid test origin"),
    environment: Environment::Production,
    cache: CacheConfig {
      version: version.to_string(),
      database: None,
      max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
    },
    precache: precache.iter().map(|p| p.to_string()).collect(),
    skip_waiting_on_install: true,
    navigation_fallback: default_navigation_fallback(),
    routes: None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
origin: https://shamah.example
cache:
  version: shamah-pwa-v2
precache: [/, /index.html, /manifest.json, /icons/icon-192.svg, /icons/icon-512.svg]
"#;

  #[test]
  fn test_defaults() {
    let config = Config::from_yaml(MINIMAL).unwrap();
    config.validate().unwrap();

    assert_eq!(config.environment, Environment::Production);
    assert!(config.skip_waiting_on_install);
    assert_eq!(config.navigation_fallback, "/index.html");
    assert_eq!(config.cache.max_entry_bytes, DEFAULT_MAX_ENTRY_BYTES);
    assert!(config.routes.is_none());
    assert_eq!(config.precache.len(), 5);
  }

  #[test]
  fn test_full_config() {
    let config = Config::from_yaml(
      r#"
origin: http://localhost:8080
environment: development
skip_waiting_on_install: false
cache:
  version: v3
  database: /tmp/shell.db
  max_entry_bytes: 1024
precache: [/]
routes:
  - when: { path_prefix: [/api/] }
    strategy: network-first
  - strategy: cache-first
"#,
    )
    .unwrap();
    config.validate().unwrap();

    assert_eq!(config.environment, Environment::Development);
    assert!(!config.skip_waiting_on_install);
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/shell.db"));
    assert_eq!(config.routes.as_ref().map(Vec::len), Some(2));
  }

  #[test]
  fn test_validation_errors() {
    let mut config = Config::from_yaml(MINIMAL).unwrap();
    config.precache.push("icons/relative.svg".to_string());
    assert!(config.validate().is_err());

    let mut config = Config::from_yaml(MINIMAL).unwrap();
    config.precache.clear();
    assert!(config.validate().is_err());

    let mut config = Config::from_yaml(MINIMAL).unwrap();
    config.cache.version = " ".to_string();
    assert!(config.validate().is_err());

    let mut config = Config::from_yaml(MINIMAL).unwrap();
    config.origin = Url::parse("file:///srv/site").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_load_from_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shell.yaml");
    std::fs::write(&path, MINIMAL).unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.cache.version, "shamah-pwa-v2");

    let missing = dir.path().join("missing.yaml");
    assert!(Config::load(Some(&missing)).is_err());
  }

  #[test]
  fn test_example_config_parses() {
    let config = Config::from_yaml(include_str!("../demos/config.example.yaml")).unwrap();
    config.validate().unwrap();

    assert_eq!(config.cache.version, "shamah-pwa-v2");
    assert_eq!(config.routes.as_ref().map(Vec::len), Some(4));
  }

  #[test]
  fn test_with_version() {
    let config = Config::from_yaml(MINIMAL).unwrap();
    let older = config.with_version("shamah-pwa-v1");
    assert_eq!(older.cache.version, "shamah-pwa-v1");
    assert_eq!(older.precache, config.precache);
  }
}
