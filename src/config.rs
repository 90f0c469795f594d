use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::uploader::{CoordinatorSettings, RetryConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub media_pool_size: usize,
    pub post_pool_size: usize,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub merge_retry_delay_ms: u64,
    pub legacy_mode: bool,
    pub request_timeout_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            media_pool_size: 3,
            post_pool_size: 1,
            max_retry_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 120_000,
            merge_retry_delay_ms: 500,
            legacy_mode: false,
            request_timeout_secs: 120,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            exponential_base: 2.0,
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            media_pool_size: self.media_pool_size,
            post_pool_size: self.post_pool_size,
            legacy_mode: self.legacy_mode,
            retry: self.retry_config(),
            merge_retry_delay: Duration::from_millis(self.merge_retry_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

pub fn get_config_path() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?
        .join("Post Upload Service");

    fs::create_dir_all(&config_dir)?;
    Ok(config_dir.join("config.json"))
}

pub fn load_config() -> AppResult<Config> {
    load_config_from(&get_config_path()?)
}

/// Load and validate the config at `path`, writing defaults if it is missing.
/// An unparseable file falls back to defaults.
pub fn load_config_from(path: &Path) -> AppResult<Config> {
    if !path.exists() {
        let default_config = Config::default();
        save_config_internal(path, &default_config)?;
        return Ok(default_config);
    }

    let config_str = fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        log::warn!("Failed to parse config file: {}. Using defaults.", e);
        Config::default()
    });

    validate_config(&config)?;
    Ok(config)
}

pub fn save_config(config: &Config) -> AppResult<()> {
    save_config_to(&get_config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &Config) -> AppResult<()> {
    validate_config(config)?;
    save_config_internal(path, config)
}

fn save_config_internal(path: &Path, config: &Config) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Create backup of existing config
    if path.exists() {
        let backup_path = path.with_extension("json.bak");
        if let Err(e) = fs::copy(path, &backup_path) {
            log::warn!("Failed to create config backup: {}", e);
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(path, config_str)?;

    log::info!("Configuration saved to {}", path.display());
    Ok(())
}

pub fn validate_config(config: &Config) -> AppResult<()> {
    if config.api_base_url.trim().is_empty() {
        return Err(AppError::validation("api_base_url", "Must not be empty"));
    }

    let url = &config.api_base_url;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(AppError::validation("api_base_url", "Must be an http(s) URL"));
    }

    if config.media_pool_size == 0 || config.media_pool_size > 16 {
        return Err(AppError::validation("media_pool_size", "Must be between 1 and 16"));
    }

    if config.post_pool_size == 0 || config.post_pool_size > 8 {
        return Err(AppError::validation("post_pool_size", "Must be between 1 and 8"));
    }

    if config.max_retry_attempts > 10 {
        return Err(AppError::validation("max_retry_attempts", "Must be 10 or fewer"));
    }

    if config.retry_base_delay_ms < 10 {
        return Err(AppError::validation("retry_base_delay_ms", "Must be at least 10ms"));
    }

    if config.retry_max_delay_ms < config.retry_base_delay_ms {
        return Err(AppError::validation(
            "retry_max_delay_ms",
            "Must not be lower than retry_base_delay_ms",
        ));
    }

    if config.request_timeout_secs == 0 {
        return Err(AppError::validation("request_timeout_secs", "Must be greater than 0"));
    }

    // Validate log level
    let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
    if !valid_log_levels.contains(&config.log_level.as_str()) {
        return Err(AppError::validation("log_level", "Must be a valid log level"));
    }

    Ok(())
}

/// Replace a config file that no longer parses with defaults, keeping the
/// old contents next to it as `config.json.old`.
pub fn migrate_config_at(path: &Path) -> AppResult<()> {
    if !path.exists() {
        return Ok(());
    }

    let config_str = fs::read_to_string(path)?;
    if serde_json::from_str::<Config>(&config_str).is_ok() {
        return Ok(());
    }

    log::info!("Migrating configuration to new format");

    let backup_path = path.with_extension("json.old");
    fs::copy(path, &backup_path)?;
    save_config_internal(path, &Config::default())?;

    log::info!("Old configuration backed up to {}", backup_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "post_upload_service_config_{}_{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir.join("config.json")
    }

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let path = temp_config_path("missing");
        let config = load_config_from(&path).unwrap();

        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_config_path("partial");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"media_pool_size": 5, "legacy_mode": true}"#).unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.media_pool_size, 5);
        assert!(config.legacy_mode);
        assert_eq!(config.post_pool_size, 1);
    }

    #[test]
    fn test_validation_rejects_out_of_range_values() {
        let mut config = Config::default();
        config.media_pool_size = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.retry_max_delay_ms = 5;
        assert!(matches!(
            validate_config(&config),
            Err(AppError::Validation { field, .. }) if field == "retry_max_delay_ms"
        ));

        let mut config = Config::default();
        config.log_level = "verbose".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_save_keeps_backup_of_previous_file() {
        let path = temp_config_path("backup");
        save_config_to(&path, &Config::default()).unwrap();

        let mut changed = Config::default();
        changed.post_pool_size = 2;
        save_config_to(&path, &changed).unwrap();

        assert!(path.with_extension("json.bak").exists());
        assert_eq!(load_config_from(&path).unwrap().post_pool_size, 2);
    }

    #[test]
    fn test_migrate_replaces_unreadable_file() {
        let path = temp_config_path("migrate");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json at all").unwrap();

        migrate_config_at(&path).unwrap();

        assert_eq!(
            fs::read_to_string(path.with_extension("json.old")).unwrap(),
            "not json at all"
        );
        assert_eq!(load_config_from(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_derived_runtime_settings() {
        let config = Config {
            max_retry_attempts: 5,
            retry_base_delay_ms: 200,
            merge_retry_delay_ms: 50,
            ..Config::default()
        };

        let settings = config.coordinator_settings();
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(200));
        assert_eq!(settings.merge_retry_delay, Duration::from_millis(50));
        assert_eq!(settings.media_pool_size, 3);
    }
}
