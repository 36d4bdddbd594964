use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use facewatch_core::tracker::{DEFAULT_CELL_PX, DEFAULT_COOLDOWN_GROUP};
use facewatch_core::BucketGrid;
use serde::Deserialize;
use thiserror::Error;

use crate::dispatch::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
///
/// Built from defaults, then the TOML file named by `FACEWATCH_CONFIG` (if
/// set), then `FACEWATCH_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Edge of a fine tracking cell, in source pixels.
    pub track_cell_px: f32,
    /// Fine cells per cooldown cell edge.
    pub cooldown_group: i32,
    /// Pause between event delivery attempts.
    pub sink_retry_backoff_ms: u64,
    /// Delivery retries after the first failed attempt.
    pub sink_max_retries: u32,
    /// Frames buffered per camera session before the reader blocks.
    pub frame_queue: usize,
    /// Serve the control interface on the session bus.
    pub dbus_enabled: bool,
    /// Seconds to wait for in-flight events at shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: facewatch_store::default_db_path(),
            track_cell_px: DEFAULT_CELL_PX,
            cooldown_group: DEFAULT_COOLDOWN_GROUP,
            sink_retry_backoff_ms: 1000,
            sink_max_retries: 3,
            frame_queue: 32,
            dbus_enabled: true,
            shutdown_grace_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let mut config = match lookup("FACEWATCH_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(lookup);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `FACEWATCH_*` variables resolved through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("FACEWATCH_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        self.track_cell_px = env_or(&lookup, "FACEWATCH_TRACK_CELL_PX", self.track_cell_px);
        self.cooldown_group = env_or(&lookup, "FACEWATCH_COOLDOWN_GROUP", self.cooldown_group);
        self.sink_retry_backoff_ms =
            env_or(&lookup, "FACEWATCH_SINK_RETRY_BACKOFF_MS", self.sink_retry_backoff_ms);
        self.sink_max_retries = env_or(&lookup, "FACEWATCH_SINK_MAX_RETRIES", self.sink_max_retries);
        self.frame_queue = env_or(&lookup, "FACEWATCH_FRAME_QUEUE", self.frame_queue);
        self.shutdown_grace_secs =
            env_or(&lookup, "FACEWATCH_SHUTDOWN_GRACE_SECS", self.shutdown_grace_secs);
        if let Some(v) = lookup("FACEWATCH_DBUS_ENABLED") {
            self.dbus_enabled = v != "0";
        }
    }

    pub fn grid(&self) -> BucketGrid {
        BucketGrid::new(self.track_cell_px, self.cooldown_group)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.sink_max_retries,
            backoff: Duration::from_millis(self.sink_retry_backoff_ms),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn env_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
                current
            }
        },
        None => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = Config::from_toml_str(
            r#"
db_path = "/var/lib/facewatch/db.sqlite"
track_cell_px = 64.0
dbus_enabled = false
"#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/facewatch/db.sqlite"));
        assert_eq!(config.track_cell_px, 64.0);
        assert!(!config.dbus_enabled);
        assert_eq!(config.sink_max_retries, 3);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml_str("sink_retry_backoff_ms = 250").unwrap();
        config.apply_env(lookup(&[
            ("FACEWATCH_SINK_RETRY_BACKOFF_MS", "5"),
            ("FACEWATCH_COOLDOWN_GROUP", "2"),
            ("FACEWATCH_DBUS_ENABLED", "0"),
        ]));
        assert_eq!(config.retry_policy().backoff, Duration::from_millis(5));
        assert_eq!(config.grid().cooldown_group, 2);
        assert!(!config.dbus_enabled);
    }

    #[test]
    fn test_bad_env_value_keeps_current() {
        let mut config = Config::default();
        config.apply_env(lookup(&[("FACEWATCH_FRAME_QUEUE", "many")]));
        assert_eq!(config.frame_queue, 32);
    }

    #[test]
    fn test_unknown_type_in_file_is_error() {
        assert!(matches!(
            Config::from_toml_str("frame_queue = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
