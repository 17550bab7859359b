use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::JobGuardConfig;
use crate::error::{ErrorCode, JobGuardError, Result};

pub const CONFIG_ENV: &str = "JOBGUARD_CONFIG";
pub const REDIS_URL_ENV: &str = "JOBGUARD_REDIS_URL";
pub const DATABASE_URL_ENV: &str = "JOBGUARD_DATABASE_URL";
pub const MAX_RETRIES_ENV: &str = "JOBGUARD_MAX_RETRIES";
pub const DLQ_MAX_SIZE_ENV: &str = "JOBGUARD_DLQ_MAX_SIZE";
pub const LOG_LEVEL_ENV: &str = "JOBGUARD_LOG_LEVEL";

/// `~/.jobguard/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".jobguard").join("config.toml"))
}

/// Resolves, reads, overrides and validates the configuration
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader reading overrides from the process environment
    pub fn new() -> Self {
        Self {
            explicit_path: None,
            lookup: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Use this file instead of the env/home lookup
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    /// Replace the environment lookup (tests)
    pub fn with_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.lookup = Box::new(lookup);
        self
    }

    /// The file that will be read, if any; an explicit path must exist
    pub fn resolve_path(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.explicit_path {
            return if path.exists() {
                Ok(Some(path.clone()))
            } else {
                Err(JobGuardError::config_with_code(
                    ErrorCode::CONFIG_NOT_FOUND,
                    format!("Config file not found: {}", path.display()),
                ))
            };
        }
        if let Some(path) = (self.lookup)(CONFIG_ENV).map(PathBuf::from) {
            return if path.exists() {
                Ok(Some(path))
            } else {
                Err(JobGuardError::config_with_code(
                    ErrorCode::CONFIG_NOT_FOUND,
                    format!("{} points at a missing file: {}", CONFIG_ENV, path.display()),
                ))
            };
        }
        Ok(default_config_path().filter(|p| p.exists()))
    }

    pub async fn load(&self) -> Result<JobGuardConfig> {
        let mut config = match self.resolve_path()? {
            Some(path) => read_file(&path).await?,
            None => {
                debug!("No config file found, using defaults");
                JobGuardConfig::default()
            }
        };
        self.apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Layer `JOBGUARD_*` variables over the file values
    pub fn apply_env_overrides(&self, config: &mut JobGuardConfig) {
        if let Some(url) = (self.lookup)(REDIS_URL_ENV) {
            config.storage = config.storage.clone().with_redis_url(url);
        }
        if let Some(url) = (self.lookup)(DATABASE_URL_ENV) {
            config.storage = config.storage.clone().with_database_url(url);
        }
        if let Some(raw) = (self.lookup)(MAX_RETRIES_ENV) {
            match raw.parse() {
                Ok(value) => config.retry.max_retries = value,
                Err(_) => warn!("Ignoring {}={}: not a number", MAX_RETRIES_ENV, raw),
            }
        }
        if let Some(raw) = (self.lookup)(DLQ_MAX_SIZE_ENV) {
            match raw.parse() {
                Ok(value) => config.dlq.max_size = value,
                Err(_) => warn!("Ignoring {}={}: not a number", DLQ_MAX_SIZE_ENV, raw),
            }
        }
        if let Some(level) = (self.lookup)(LOG_LEVEL_ENV) {
            config.log_level = Some(level.to_ascii_lowercase());
        }
    }
}

async fn read_file(path: &Path) -> Result<JobGuardConfig> {
    debug!("Loading config from {}", path.display());
    let content = fs::read_to_string(path).await.map_err(|e| {
        JobGuardError::config_with_code(
            ErrorCode::CONFIG_NOT_FOUND,
            format!("Failed to read {}", path.display()),
        )
        .with_source(e)
    })?;
    JobGuardConfig::from_toml(&content).map_err(|e| e.with_context(path.display()))
}

/// Load with the default resolution order, optionally forcing a file
pub async fn load_config(path: Option<&Path>) -> Result<JobGuardConfig> {
    let loader = match path {
        Some(p) => ConfigLoader::new().with_path(p),
        None => ConfigLoader::new(),
    };
    loader.load().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackendType, StoreType};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let loader = ConfigLoader::new().with_lookup(env(&[
            (REDIS_URL_ENV, "redis://cache:6379"),
            (DATABASE_URL_ENV, "postgres://db/jobs"),
            (MAX_RETRIES_ENV, "5"),
            (DLQ_MAX_SIZE_ENV, "not-a-number"),
            (LOG_LEVEL_ENV, "DEBUG"),
        ]));
        let mut config = JobGuardConfig::default();
        loader.apply_env_overrides(&mut config);

        assert_eq!(config.storage.backend, BackendType::Redis);
        assert_eq!(config.storage.store, StoreType::Postgres);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.dlq.max_size, 1000);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[tokio::test]
    async fn test_missing_explicit_path_is_an_error() {
        let err = ConfigLoader::new()
            .with_path("/definitely/not/here.toml")
            .with_lookup(env(&[]))
            .load()
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_env_path_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobguard.toml");
        std::fs::write(&path, "[dlq]\nmax_size = 42\n").unwrap();

        let config = ConfigLoader::new()
            .with_lookup(env(&[(CONFIG_ENV, path.to_str().unwrap())]))
            .load()
            .await
            .unwrap();
        assert_eq!(config.dlq.max_size, 42);
    }

    #[tokio::test]
    async fn test_invalid_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[orchestrator]\nbacklog_warning = 5000\n").unwrap();

        let err = ConfigLoader::new()
            .with_path(&path)
            .with_lookup(env(&[]))
            .load()
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_VALIDATION_FAILED);
    }
}
