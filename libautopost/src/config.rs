//! Configuration management for AutoPost
//!
//! Configuration lives in a TOML file. Every section has defaults, so an absent
//! file or an empty one yields a working configuration. Values are checked once
//! with [`Config::validate`] when a binary starts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::scheduler::slots::{parse_timezone, TimeSlot};

pub const DEFAULT_POST_TIMES: [&str; 3] = ["09:00", "15:00", "21:00"];
pub const DEFAULT_TIMEZONE: &str = "America/Sao_Paulo";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schedule: ScheduleConfig,
    pub paths: PathsConfig,
    pub retry: RetryConfig,
    pub cleanup: CleanupConfig,
    pub remote: RemoteConfig,
    pub publisher: PublisherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub post_times: Vec<String>,
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            post_times: DEFAULT_POST_TIMES.iter().map(|t| t.to_string()).collect(),
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding content folders waiting to be posted
    pub content: String,
    /// Directory for the database and processed images
    pub data: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            content: "~/.local/share/autopost/content".to_string(),
            data: "~/.local/share/autopost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base: String,
    pub publish_timeout: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: "30s".to_string(),
            publish_timeout: "2m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub retention_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Directory mirrored as the remote folder store; sync is off when unset
    pub source: Option<String>,
    pub sync_interval: String,
    pub download_concurrency: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            source: None,
            sync_interval: "30m".to_string(),
            download_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub outbox: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            outbox: "~/.local/share/autopost/outbox".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file is not an error: defaults are used instead.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        if !config_path.exists() {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Check every value that can be wrong in a syntactically valid file
    pub fn validate(&self) -> Result<()> {
        for time in &self.schedule.post_times {
            TimeSlot::parse(time).map_err(|e| invalid("schedule.post_times", e))?;
        }
        parse_timezone(&self.schedule.timezone).map_err(|e| invalid("schedule.timezone", e))?;

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1").into());
        }
        self.backoff_base()?;
        self.publish_timeout()?;
        self.sync_interval()?;

        if self.remote.download_concurrency == 0 {
            return Err(invalid("remote.download_concurrency", "must be at least 1").into());
        }
        if self.paths.content.trim().is_empty() {
            return Err(ConfigError::MissingField("paths.content".to_string()).into());
        }
        if self.paths.data.trim().is_empty() {
            return Err(ConfigError::MissingField("paths.data".to_string()).into());
        }
        Ok(())
    }

    pub fn content_dir(&self) -> PathBuf {
        expand(&self.paths.content)
    }

    pub fn data_dir(&self) -> PathBuf {
        expand(&self.paths.data)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("autopost.db")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        expand(&self.publisher.outbox)
    }

    pub fn remote_source(&self) -> Option<PathBuf> {
        self.remote.source.as_deref().map(expand)
    }

    pub fn backoff_base(&self) -> Result<Duration> {
        parse_duration("retry.backoff_base", &self.retry.backoff_base)
    }

    pub fn publish_timeout(&self) -> Result<Duration> {
        parse_duration("retry.publish_timeout", &self.retry.publish_timeout)
    }

    pub fn sync_interval(&self) -> Result<Duration> {
        parse_duration("remote.sync_interval", &self.remote.sync_interval)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Every configured duration is a period or a deadline, so zero is rejected
fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value).map_err(|e| invalid(field, e))?;
    if duration.is_zero() {
        return Err(invalid(field, "must be greater than zero").into());
    }
    Ok(duration)
}

fn invalid(field: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Resolve the configuration file path using XDG base directories
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("AUTOPOST_CONFIG") {
        return Ok(expand(&path));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("autopost").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.schedule.post_times, vec!["09:00", "15:00", "21:00"]);
        assert_eq!(config.schedule.timezone, "America/Sao_Paulo");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.backoff_base().unwrap(), Duration::from_secs(30));
        assert_eq!(config.publish_timeout().unwrap(), Duration::from_secs(120));
        assert_eq!(config.sync_interval().unwrap(), Duration::from_secs(30 * 60));
        assert_eq!(config.cleanup.retention_days, 30);
        assert!(config.remote_source().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[schedule]
post_times = ["08:30"]

[retry]
max_attempts = 5
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.schedule.post_times, vec!["08:30"]);
        assert_eq!(config.schedule.timezone, DEFAULT_TIMEZONE);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_base, "30s");
    }

    #[test]
    fn test_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[schedule\npost_times = 3").unwrap();

        let result = Config::load_from_path(&path);
        assert!(matches!(
            result,
            Err(crate::AutopostError::Config(ConfigError::ParseError(_)))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_time() {
        let mut config = Config::default();
        config.schedule.post_times = vec!["9am".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("schedule.post_times"));
    }

    #[test]
    fn test_validate_rejects_unknown_timezone() {
        let mut config = Config::default();
        config.schedule.timezone = "Mars/Olympus_Mons".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("schedule.timezone"));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_duration() {
        let mut config = Config::default();
        config.retry.backoff_base = "soon".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.backoff_base"));
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let mut config = Config::default();
        config.remote.sync_interval = "0s".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("remote.sync_interval"));
        assert_eq!(err.exit_code(), 2);

        let mut config = Config::default();
        config.retry.publish_timeout = "0s".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.publish_timeout"));

        let mut config = Config::default();
        config.retry.backoff_base = "0ms".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.backoff_base"));
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_from_env() {
        std::env::set_var("AUTOPOST_CONFIG", "/tmp/autopost-test/config.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("AUTOPOST_CONFIG");
        assert_eq!(path, PathBuf::from("/tmp/autopost-test/config.toml"));
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.toml");
        std::env::set_var("AUTOPOST_CONFIG", &path);
        let config = Config::load();
        std::env::remove_var("AUTOPOST_CONFIG");
        assert_eq!(config.unwrap().retry.max_attempts, 3);
    }
}
