use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::chat::Tunables;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  /// The signed-in user this client acts as.
  pub user_id: Uuid,
  #[serde(default)]
  pub tuning: TuningConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the hosted backend, e.g. https://project.example.co
  pub url: String,
}

/// Product-tuned knobs; see `Tunables` for what each one drives. All
/// optional with shipped defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
  pub presence_window_secs: u64,
  pub list_ttl_secs: u64,
  pub detail_ttl_secs: u64,
  pub reference_ttl_secs: u64,
  /// Change-feed poll interval for the REST source.
  pub poll_interval_secs: u64,
}

impl Default for TuningConfig {
  fn default() -> Self {
    Self {
      presence_window_secs: 5 * 60,
      list_ttl_secs: 5 * 60,
      detail_ttl_secs: 10 * 60,
      reference_ttl_secs: 30 * 60,
      poll_interval_secs: 5,
    }
  }
}

impl TuningConfig {
  pub fn tunables(&self) -> Tunables {
    Tunables {
      presence_window: Duration::seconds(self.presence_window_secs as i64),
      list_ttl: Duration::seconds(self.list_ttl_secs as i64),
      detail_ttl: Duration::seconds(self.detail_ttl_secs as i64),
      reference_ttl: Duration::seconds(self.reference_ttl_secs as i64),
    }
  }

  pub fn poll_interval(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.poll_interval_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./chatsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/chatsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/chatsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("chatsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("chatsync").join("config.yaml");
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

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_minimal_config_with_defaults() {
    let config: Config = serde_yaml::from_str(
      r#"
backend:
  url: https://project.example.co
user_id: 7f2c1e9a-0000-4000-8000-000000000001
"#,
    )
    .unwrap();

    assert_eq!(config.backend.url, "https://project.example.co");
    assert_eq!(config.tuning.presence_window_secs, 300);
    assert_eq!(config.tuning.reference_ttl_secs, 1800);
  }

  #[test]
  fn tuning_overrides_apply() {
    let config: Config = serde_yaml::from_str(
      r#"
backend:
  url: https://project.example.co
user_id: 7f2c1e9a-0000-4000-8000-000000000001
tuning:
  presence_window_secs: 60
  poll_interval_secs: 2
"#,
    )
    .unwrap();

    let tunables = config.tuning.tunables();
    assert_eq!(tunables.presence_window, Duration::seconds(60));
    // Unset fields keep their defaults.
    assert_eq!(tunables.list_ttl, Duration::seconds(300));
    assert_eq!(config.tuning.poll_interval(), std::time::Duration::from_secs(2));
  }
}
