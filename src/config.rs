use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MonitorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
}

/// Mail provider connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// Required API key for the mail provider
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_mail_api_base")]
    pub api_base: String,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_mail_api_base(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

/// LLM endpoint settings. An empty API key disables the LLM tier entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_api_base")]
    pub api_base: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_llm_api_base(),
            model: default_llm_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Inboxes scanned concurrently per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Hard cap on concurrent classification workers
    #[serde(default = "default_pipeline_max_concurrent")]
    pub pipeline_max_concurrent: usize,
    /// Auto-sync reconciliation period
    #[serde(default = "default_sync_interval_seconds")]
    pub sync_interval_seconds: u64,
    /// Pinned timestamp of the current rule bank. Cached `rules`-sourced
    /// classifications created before this instant are re-classified.
    #[serde(default)]
    pub classifier_rules_version: Option<DateTime<Utc>>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            pipeline_max_concurrent: default_pipeline_max_concurrent(),
            sync_interval_seconds: default_sync_interval_seconds(),
            classifier_rules_version: None,
        }
    }
}

fn default_mail_api_base() -> String {
    "https://api.smtp.dev".to_string()
}

fn default_cache_ttl_seconds() -> u64 {
    60
}

fn default_max_concurrent_requests() -> usize {
    20
}

fn default_llm_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_pipeline_max_concurrent() -> usize {
    5
}

fn default_sync_interval_seconds() -> u64 {
    300
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MonitorError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| MonitorError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MonitorError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| MonitorError::Config(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| MonitorError::Config(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.mail.api_key.is_empty() {
            return Err(MonitorError::Config(
                "mail.api_key is required".to_string(),
            ));
        }

        if self.mail.max_concurrent_requests == 0 {
            return Err(MonitorError::Config(
                "mail.max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.mail.max_concurrent_requests > 50 {
            return Err(MonitorError::Config(
                "mail.max_concurrent_requests cannot exceed 50".to_string(),
            ));
        }

        if self.mail.cache_ttl_seconds == 0 {
            return Err(MonitorError::Config(
                "mail.cache_ttl_seconds must be at least 1".to_string(),
            ));
        }

        if self.scanner.batch_size == 0 {
            return Err(MonitorError::Config(
                "scanner.batch_size must be at least 1".to_string(),
            ));
        }
        if self.scanner.batch_size > 50 {
            return Err(MonitorError::Config(
                "scanner.batch_size cannot exceed 50 (keeps provider load bounded)".to_string(),
            ));
        }

        if self.scanner.pipeline_max_concurrent == 0 {
            return Err(MonitorError::Config(
                "scanner.pipeline_max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.scanner.pipeline_max_concurrent > 20 {
            return Err(MonitorError::Config(
                "scanner.pipeline_max_concurrent cannot exceed 20".to_string(),
            ));
        }

        if self.scanner.sync_interval_seconds < 30 {
            return Err(MonitorError::Config(
                "scanner.sync_interval_seconds must be at least 30".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.mail.api_key = "test-key".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.mail.api_base, "https://api.smtp.dev");
        assert_eq!(config.mail.cache_ttl_seconds, 60);
        assert_eq!(config.mail.max_concurrent_requests, 20);

        assert!(config.llm.api_key.is_empty());
        assert_eq!(config.llm.api_base, "https://api.openai.com/v1");

        assert_eq!(config.scanner.batch_size, 10);
        assert_eq!(config.scanner.pipeline_max_concurrent, 5);
        assert_eq!(config.scanner.sync_interval_seconds, 300);
        assert!(config.scanner.classifier_rules_version.is_none());
    }

    #[test]
    fn test_validation_requires_api_key() {
        let config = Config::default();
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("api_key"));
    }

    #[test]
    fn test_validation_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_batch_size_bounds() {
        let mut config = valid_config();
        config.scanner.batch_size = 0;
        assert!(config.validate().is_err());

        config.scanner.batch_size = 51;
        assert!(config.validate().is_err());

        config.scanner.batch_size = 1;
        assert!(config.validate().is_ok());
        config.scanner.batch_size = 50;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_pipeline_concurrency_bounds() {
        let mut config = valid_config();
        config.scanner.pipeline_max_concurrent = 0;
        assert!(config.validate().is_err());

        config.scanner.pipeline_max_concurrent = 21;
        assert!(config.validate().is_err());

        config.scanner.pipeline_max_concurrent = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_sync_interval_floor() {
        let mut config = valid_config();
        config.scanner.sync_interval_seconds = 10;
        assert!(config.validate().is_err());

        config.scanner.sync_interval_seconds = 30;
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_load_save_roundtrip() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let mut config = valid_config();
        config.scanner.classifier_rules_version =
            Some("2024-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        config.save(path).await.unwrap();

        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.mail.api_key, "test-key");
        assert_eq!(loaded.scanner.batch_size, 10);
        assert_eq!(
            loaded.scanner.classifier_rules_version,
            config.scanner.classifier_rules_version
        );
    }

    #[tokio::test]
    async fn test_config_load_nonexistent_returns_default() {
        let path = Path::new("/tmp/nonexistent-dasher-monitor-config.toml");
        let config = Config::load(path).await.unwrap();
        assert_eq!(config.scanner.batch_size, 10);
    }

    #[tokio::test]
    async fn test_config_load_invalid_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        tokio::fs::write(path, "this is not valid toml {[}]")
            .await
            .unwrap();

        let result = Config::load(path).await;
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file"));
    }

    #[tokio::test]
    async fn test_config_partial_with_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let partial = r#"
[mail]
api_key = "abc123"

[scanner]
batch_size = 4
"#;
        tokio::fs::write(path, partial).await.unwrap();

        let config = Config::load(path).await.unwrap();
        assert_eq!(config.mail.api_key, "abc123");
        assert_eq!(config.scanner.batch_size, 4);
        // Untouched fields keep their defaults
        assert_eq!(config.scanner.pipeline_max_concurrent, 5);
        assert_eq!(config.mail.api_base, "https://api.smtp.dev");
    }
}
