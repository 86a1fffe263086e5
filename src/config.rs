use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the app shell and intercepted requests are fetched from
  pub origin: String,
  /// Cache generation identifier. Bump it whenever `app_shell` changes.
  pub cache_name: String,
  /// Root-relative paths that make up the offline app shell, in install order
  #[serde(deserialize_with = "deserialize_app_shell")]
  pub app_shell: Vec<String>,
  /// URL substrings that mark dynamic endpoints (real-time channel, API namespace)
  pub bypass: Vec<String>,
  pub request_timeout_secs: u64,
  /// Cache database location (defaults to the user data directory)
  pub database: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8000".to_string(),
      cache_name: "manus-pwa-v1".to_string(),
      app_shell: vec![
        "/".to_string(),
        "/static/styles.css".to_string(),
        "/static/app.js".to_string(),
        "/manifest.webmanifest".to_string(),
        "/static/icons/icon.svg".to_string(),
      ],
      bypass: vec!["/ws".to_string(), "/api/".to_string()],
      request_timeout_secs: 30,
      database: None,
    }
  }
}

fn deserialize_app_shell<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let paths: Vec<String> = Vec::deserialize(deserializer)?;
  validate_app_shell(&paths).map_err(serde::de::Error::custom)?;
  Ok(paths)
}

/// App shell entries must be unique and root-relative.
///
/// A leading `//` is protocol-relative and would resolve to another host.
pub fn validate_app_shell(paths: &[String]) -> Result<()> {
  let mut seen = BTreeSet::new();
  for path in paths {
    if !path.starts_with('/') || path.starts_with("//") {
      return Err(eyre!("App shell entry must be root-relative: {}", path));
    }
    if !seen.insert(path.as_str()) {
      return Err(eyre!("Duplicate app shell entry: {}", path));
    }
  }
  Ok(())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
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
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Path of the cache database, honouring the `database` override.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }
}
