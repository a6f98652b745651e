use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::{APP_NAME, Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

pub const CONFIG_DIR_ENV: &str = "DRIVEPROGRESS_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "DRIVEPROGRESS_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub receiver: ReceiverSettings,
    #[serde(default)]
    pub status: StatusSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    /// Bound of the worker → main channel.
    pub channel_capacity: usize,
    /// Max messages taken per non-blocking drain.
    pub drain_batch: usize,
    /// Merge consecutive `progress` deltas of one item within a drain.
    pub coalesce_progress: bool,
    /// Finished transfers and completed batches kept for display; older
    /// ones are forgotten.
    pub retain_terminal: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSettings {
    pub active_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub write_status_json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when neither env variable is set.
    #[serde(default)]
    pub filter: Option<String>,
    /// Also write an NDJSON log file per daemon session under `<data_dir>/logs`.
    #[serde(default)]
    pub session_file: bool,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            drain_batch: 256,
            coalesce_progress: true,
            retain_terminal: 256,
        }
    }
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            active_interval_ms: 100,
            idle_interval_ms: 1000,
            write_status_json: true,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            receiver: ReceiverSettings::default(),
            status: StatusSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME)
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join(APP_NAME)
}

/// Flag, then environment, then the default under `$HOME`.
pub fn resolve_config_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir)
}

pub fn resolve_data_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var(DATA_DIR_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir)
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings schema version")),
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    let text = to_toml(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    if settings.receiver.channel_capacity < 1 {
        return Err(Error::InvalidConfig {
            message: "receiver.channel_capacity must be >= 1".to_string(),
        });
    }

    if settings.receiver.drain_batch < 1 {
        return Err(Error::InvalidConfig {
            message: "receiver.drain_batch must be >= 1".to_string(),
        });
    }

    if settings.status.active_interval_ms == 0 || settings.status.idle_interval_ms == 0 {
        return Err(Error::InvalidConfig {
            message: "status intervals must be > 0".to_string(),
        });
    }

    if let Some(filter) = settings.logging.filter.as_deref()
        && tracing_subscriber::EnvFilter::try_new(filter).is_err()
    {
        return Err(Error::InvalidConfig {
            message: format!("logging.filter is not a valid filter directive: {filter:?}"),
        });
    }

    Ok(())
}

pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings(dir.path()).unwrap();
        assert_eq!(s.version, SETTINGS_SCHEMA_VERSION);
        assert_eq!(s.receiver.channel_capacity, 1024);
        assert!(s.receiver.coalesce_progress);
        assert_eq!(s.status.active_interval_ms, 100);
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings::default();
        s.receiver.drain_batch = 8;
        s.logging.filter = Some("warn".to_string());
        save_settings(dir.path(), &s).unwrap();

        let got = load_settings(dir.path()).unwrap();
        assert_eq!(got.receiver.drain_batch, 8);
        assert_eq!(got.logging.filter.as_deref(), Some("warn"));
    }

    #[test]
    fn sections_and_fields_are_optional() {
        let s = parse_settings("version = 1\n").unwrap();
        assert_eq!(s.receiver.drain_batch, 256);
        assert!(s.status.write_status_json);

        let s = parse_settings("version = 1\n[receiver]\ndrain_batch = 4\n").unwrap();
        assert_eq!(s.receiver.drain_batch, 4);
        assert_eq!(s.receiver.channel_capacity, 1024);
        assert_eq!(s.receiver.retain_terminal, 256);

        let s = parse_settings("version = 1\n[receiver]\nretain_terminal = 0\n").unwrap();
        assert_eq!(s.receiver.retain_terminal, 0);
    }

    #[test]
    fn rejects_unknown_version_and_zero_capacity() {
        assert!(parse_settings("version = 7\n").is_err());
        assert!(parse_settings("[receiver]\ndrain_batch = 1\n").is_err());

        let mut s = Settings::default();
        s.receiver.channel_capacity = 0;
        assert!(matches!(
            validate_settings(&s),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn rejects_bad_filter_directive() {
        let mut s = Settings::default();
        s.logging.filter = Some("driveprogress=verbose".to_string());
        assert!(validate_settings(&s).is_err());
    }
}
