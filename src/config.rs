use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::payload::EntityKind;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  /// Entity kind -> collection path on the remote service
  #[serde(default)]
  pub endpoints: EndpointTable,
  /// Kinds whose offline creates get a temporary id that other records can reference
  #[serde(default, deserialize_with = "deserialize_kind_set")]
  pub temporary_kinds: BTreeSet<EntityKind>,
  /// Read endpoints to re-fetch after a sync pass that changed something
  #[serde(default)]
  pub refresh_after_sync: Vec<String>,
  #[serde(default)]
  pub storage: StorageConfig,
  /// Seconds between connectivity probes
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
}

fn deserialize_kind_set<'de, D>(deserializer: D) -> Result<BTreeSet<EntityKind>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| EntityKind::new(s.to_lowercase())).collect())
}

fn default_probe_interval() -> u64 {
  10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub url: String,
  /// Path polled to decide whether the service is reachable
  #[serde(default = "default_health_path")]
  pub health_path: String,
  #[serde(default = "default_timeout")]
  pub timeout_secs: u64,
  /// Response field carrying the id of a newly created record
  #[serde(default = "default_id_field")]
  pub id_field: String,
}

fn default_health_path() -> String {
  "/health".to_string()
}

fn default_timeout() -> u64 {
  15
}

fn default_id_field() -> String {
  "id".to_string()
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/rollbook/state.db)
  pub path: Option<PathBuf>,
}

/// Maps each entity kind to the collection path used for create, update and delete.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct EndpointTable(BTreeMap<EntityKind, String>);

impl EndpointTable {
  pub fn from_pairs<I, K, P>(pairs: I) -> Self
  where
    I: IntoIterator<Item = (K, P)>,
    K: Into<String>,
    P: Into<String>,
  {
    Self(
      pairs
        .into_iter()
        .map(|(k, p)| (EntityKind::new(k), p.into()))
        .collect(),
    )
  }

  /// Collection path for `kind`, without a trailing slash.
  pub fn collection(&self, kind: &EntityKind) -> SyncResult<&str> {
    self
      .0
      .get(kind)
      .map(|p| p.trim_end_matches('/'))
      .ok_or_else(|| SyncError::UnknownKind(kind.to_string()))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rollbook.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rollbook/config.yaml
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
        "No configuration file found. Create one at ~/.config/rollbook/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("rollbook.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rollbook").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;

    if let Some(kind) = config
      .temporary_kinds
      .iter()
      .find(|k| config.endpoints.collection(k).is_err())
    {
      return Err(eyre!(
        "temporary kind {:?} has no entry under endpoints",
        kind.as_str()
      ));
    }

    Ok(config)
  }

  /// Where the durable store lives.
  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(p) => Ok(p.clone()),
      None => crate::store::SqliteStore::default_path().map_err(|e| eyre!("{}", e)),
    }
  }

  /// Bearer token for the remote service, from ROLLBOOK_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("ROLLBOOK_API_TOKEN").ok()
  }
}
