//! Configuration management for Tokenshare Server

use std::env;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use crate::share::{
    LifecycleConfig, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_RETENTION_HOURS, MAX_RETENTION_HOURS,
};
use crate::storage::RetryPolicy;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
    pub cleanup: CleanupConfig,
    pub mail: Option<MailConfig>,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base of the download links sent to recipients
    pub public_base_url: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for staged chunks and share files
    pub upload_folder: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_chunk_size_mb: u64,
    pub max_share_size_gb: u64,
    pub max_total_storage_gb: u64,
    pub file_retention_hours: i64,
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval_minutes: u64,
    pub orphan_grace_hours: i64,
    pub reclaim_grace_hours: i64,
    pub purge_after_days: i64,
    /// Run the background reaper
    pub auto_cleanup: bool,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_key: String,
    pub api_secret: String,
    pub from_email: String,
    pub from_name: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                public_base_url: "http://localhost:3000".to_string(),
            },
            storage: StorageConfig {
                upload_folder: "./uploads".to_string(),
                timeout_secs: 30,
                retry_attempts: 3,
            },
            limits: LimitsConfig {
                max_chunk_size_mb: DEFAULT_MAX_CHUNK_SIZE / MB,
                max_share_size_gb: 20,
                max_total_storage_gb: 100,
                file_retention_hours: DEFAULT_RETENTION_HOURS,
            },
            cleanup: CleanupConfig {
                interval_minutes: 60,
                orphan_grace_hours: 24,
                reclaim_grace_hours: 0,
                purge_after_days: 30,
                auto_cleanup: true,
            },
            mail: None,
            database: DatabaseConfig {
                url: "sqlite:./shares.db".to_string(),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
                public_base_url: env::var("PUBLIC_BASE_URL").unwrap_or(defaults.server.public_base_url),
            },
            storage: StorageConfig {
                upload_folder: env::var("UPLOAD_FOLDER").unwrap_or(defaults.storage.upload_folder),
                timeout_secs: parse_var("STORAGE_TIMEOUT_SECS", defaults.storage.timeout_secs)?,
                retry_attempts: parse_var("STORAGE_RETRY_ATTEMPTS", defaults.storage.retry_attempts)?,
            },
            limits: LimitsConfig {
                max_chunk_size_mb: parse_var("MAX_CHUNK_SIZE_MB", defaults.limits.max_chunk_size_mb)?,
                max_share_size_gb: parse_var("MAX_SHARE_SIZE_GB", defaults.limits.max_share_size_gb)?,
                max_total_storage_gb: parse_var("MAX_TOTAL_STORAGE_GB", defaults.limits.max_total_storage_gb)?,
                file_retention_hours: parse_var("FILE_RETENTION_HOURS", defaults.limits.file_retention_hours)?,
            },
            cleanup: CleanupConfig {
                interval_minutes: parse_var("CLEANUP_INTERVAL_MINUTES", defaults.cleanup.interval_minutes)?,
                orphan_grace_hours: parse_var("ORPHAN_GRACE_HOURS", defaults.cleanup.orphan_grace_hours)?,
                reclaim_grace_hours: parse_var("RECLAIM_GRACE_HOURS", defaults.cleanup.reclaim_grace_hours)?,
                purge_after_days: parse_var("PURGE_AFTER_DAYS", defaults.cleanup.purge_after_days)?,
                auto_cleanup: parse_var("AUTO_CLEANUP", defaults.cleanup.auto_cleanup)?,
            },
            mail: mail_from_env()?,
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject sizes that overflow a byte count and negative or out-of-range durations
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("MAX_CHUNK_SIZE_MB", self.limits.max_chunk_size_mb, MB),
            ("MAX_SHARE_SIZE_GB", self.limits.max_share_size_gb, GB),
            ("MAX_TOTAL_STORAGE_GB", self.limits.max_total_storage_gb, GB),
        ];
        for (key, value, unit) in sizes {
            if value.checked_mul(unit).is_none() {
                return Err(ConfigError::Invalid { key, value: value.to_string() });
            }
        }

        let hours = [
            ("FILE_RETENTION_HOURS", self.limits.file_retention_hours),
            ("ORPHAN_GRACE_HOURS", self.cleanup.orphan_grace_hours),
            ("RECLAIM_GRACE_HOURS", self.cleanup.reclaim_grace_hours),
            ("PURGE_AFTER_DAYS", self.cleanup.purge_after_days.saturating_mul(24)),
        ];
        for (key, value) in hours {
            if !(0..=MAX_RETENTION_HOURS).contains(&value) {
                return Err(ConfigError::Invalid { key, value: value.to_string() });
            }
        }
        Ok(())
    }

    /// Limits and timings for the share lifecycle
    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            max_chunk_size: self.limits.max_chunk_size_mb.saturating_mul(MB),
            max_share_bytes: self.limits.max_share_size_gb.saturating_mul(GB),
            max_total_bytes: self.limits.max_total_storage_gb.saturating_mul(GB),
            default_retention_hours: self.limits.file_retention_hours,
            orphan_grace: hours(self.cleanup.orphan_grace_hours),
            reclaim_grace: hours(self.cleanup.reclaim_grace_hours),
            purge_after: hours(self.cleanup.purge_after_days.saturating_mul(24)),
            public_base_url: self.server.public_base_url.clone(),
            retry: self.retry_policy(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.storage.retry_attempts.max(1),
            timeout: StdDuration::from_secs(self.storage.timeout_secs),
            ..RetryPolicy::default()
        }
    }

    pub fn cleanup_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.cleanup.interval_minutes.max(1) * 60)
    }
}

/// Mailjet is enabled only when both credentials are present
fn mail_from_env() -> Result<Option<MailConfig>, ConfigError> {
    let credentials = env::var("MAILJET_API_KEY")
        .ok()
        .filter(|v| !v.is_empty())
        .zip(env::var("MAILJET_API_SECRET").ok().filter(|v| !v.is_empty()));
    let Some((api_key, api_secret)) = credentials else {
        return Ok(None);
    };

    Ok(Some(MailConfig {
        api_key,
        api_secret,
        from_email: env::var("MAILJET_FROM_EMAIL").unwrap_or_else(|_| "noreply@localhost".to_string()),
        from_name: env::var("MAILJET_FROM_NAME").unwrap_or_else(|_| "File Share".to_string()),
        timeout_secs: parse_var("MAILJET_TIMEOUT_SECS", 15)?,
    }))
}

fn hours(value: i64) -> chrono::Duration {
    chrono::Duration::hours(value.clamp(0, MAX_RETENTION_HOURS))
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lifecycle() {
        let config = Config::default();
        let lifecycle = config.lifecycle();

        assert_eq!(lifecycle.max_chunk_size, 16 * MB);
        assert_eq!(lifecycle.max_share_bytes, 20 * GB);
        assert_eq!(lifecycle.default_retention_hours, 24);
        assert_eq!(lifecycle.reclaim_grace, chrono::Duration::zero());
        assert_eq!(lifecycle.retry.timeout, StdDuration::from_secs(30));
        assert_eq!(config.cleanup_interval(), StdDuration::from_secs(3600));
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        env::set_var("TOKENSHARE_TEST_PORT", "not-a-port");
        let result: Result<u16, _> = parse_var("TOKENSHARE_TEST_PORT", 3000);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
        env::remove_var("TOKENSHARE_TEST_PORT");

        let result: Result<u16, _> = parse_var("TOKENSHARE_TEST_PORT", 3000);
        assert_eq!(result.unwrap(), 3000);
    }

    #[test]
    fn test_validate_rejects_overflowing_limits() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.limits.max_share_size_gb = u64::MAX / 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "MAX_SHARE_SIZE_GB", .. })
        ));
        // Never panics even when validation is skipped
        assert_eq!(config.lifecycle().max_share_bytes, u64::MAX);

        let mut config = Config::default();
        config.cleanup.purge_after_days = i64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "PURGE_AFTER_DAYS", .. })
        ));
        assert_eq!(config.lifecycle().purge_after, chrono::Duration::hours(MAX_RETENTION_HOURS));

        let mut config = Config::default();
        config.cleanup.orphan_grace_hours = -1;
        assert!(config.validate().is_err());
    }
}
