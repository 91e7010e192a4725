use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::error::ConfigError;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::transform::features::FeatureConfig;
use crate::types::Entity;

/// Everything a pipeline run needs, resolved once at startup and passed
/// explicitly into the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sources: SourcesConfig,
    pub extract: ExtractConfig,
    pub load: LoadConfig,
    pub sink: SinkConfig,
    pub snapshots: SnapshotConfig,
    pub features: FeatureConfig,
    pub validation: ValidationConfig,
    pub logging: LoggingConfig,
    /// Prometheus listen address, e.g. "127.0.0.1:9898"; exporter is off when unset
    pub metrics_addr: Option<String>,
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub primary_url: String,
    pub fallback_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub retry: RetryPolicy,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub table: String,
    pub batch_size: usize,
    /// Retries in addition to the first attempt of each batch
    pub retry: RetryPolicy,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    /// PostgREST-compatible REST endpoint (e.g. Supabase)
    Postgrest { url: String, api_key: String },
    /// Local SQLite file
    Sqlite { path: PathBuf },
    /// Process-local sink, nothing is persisted
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Numeric columns that must never be missing in the staged dataset
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: SourcesConfig::default(),
            extract: ExtractConfig::default(),
            load: LoadConfig::default(),
            sink: SinkConfig::default(),
            snapshots: SnapshotConfig::default(),
            features: FeatureConfig::default(),
            validation: ValidationConfig::default(),
            logging: LoggingConfig::default(),
            metrics_addr: None,
            entities: Entity::default_cities(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            primary_url: constants::OPENAQ_LATEST_URL.to_string(),
            fallback_url: constants::OPEN_METEO_AIR_QUALITY_URL.to_string(),
            timeout_secs: 10,
        }
    }
}

impl SourcesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(3, 1000),
            workers: 4,
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            table: constants::DEFAULT_TABLE.to_string(),
            batch_size: 200,
            retry: RetryPolicy::new(2, 1000),
            workers: 4,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Sqlite {
            path: PathBuf::from("data/airq.sqlite"),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            required_fields: vec![constants::COL_PM2_5.to_string(), constants::COL_PM10.to_string()],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply endpoint and secret overrides. `lookup` is normally
    /// `std::env::var`; only the binary calls this.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("AIRQ_PRIMARY_URL") {
            self.sources.primary_url = url;
        }
        if let Some(url) = non_empty("AIRQ_FALLBACK_URL") {
            self.sources.fallback_url = url;
        }
        if let Some(n) = non_empty("AIRQ_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.load.batch_size = n;
        }
        if let Some(n) = non_empty("AIRQ_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.extract.retry.max_retries = n;
        }

        let sink_url = non_empty("AIRQ_SINK_URL").or_else(|| non_empty("SUPABASE_URL"));
        let sink_key = non_empty("AIRQ_SINK_KEY").or_else(|| non_empty("SUPABASE_KEY"));
        match (&mut self.sink, sink_url, sink_key) {
            (SinkConfig::Postgrest { url, api_key }, new_url, new_key) => {
                if let Some(u) = new_url {
                    *url = u;
                }
                if let Some(k) = new_key {
                    *api_key = k;
                }
            }
            (sink, Some(url), Some(api_key)) => {
                *sink = SinkConfig::Postgrest { url, api_key };
            }
            _ => {}
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entities.is_empty() {
            return Err(ConfigError::Invalid("at least one entity is required".into()));
        }
        if self.load.batch_size == 0 {
            return Err(ConfigError::Invalid("load.batch_size must be > 0".into()));
        }
        if self.extract.workers == 0 || self.load.workers == 0 {
            return Err(ConfigError::Invalid("worker pools need at least one worker".into()));
        }
        if self.extract.retry.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "extract.retry.max_retries must allow at least one primary attempt".into(),
            ));
        }
        if self.load.table.trim().is_empty() {
            return Err(ConfigError::Invalid("load.table must not be empty".into()));
        }
        if let SinkConfig::Postgrest { url, api_key } = &self.sink {
            if url.trim().is_empty() || api_key.trim().is_empty() {
                return Err(ConfigError::Invalid("postgrest sink needs url and api_key".into()));
            }
        }
        self.features.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.entities.len(), 5);
        assert_eq!(config.load.batch_size, 200);
        assert_eq!(config.extract.retry.max_retries, 3);
        assert_eq!(config.load.retry.max_retries, 2);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [load]
            batch_size = 50

            [sink]
            kind = "memory"

            [[entities]]
            key = "Delhi"
            latitude = 28.7
            longitude = 77.1
            "#,
        )
        .unwrap();
        assert_eq!(config.load.batch_size, 50);
        assert_eq!(config.load.table, constants::DEFAULT_TABLE);
        assert!(matches!(config.sink, SinkConfig::Memory));
        assert_eq!(config.entities.len(), 1);
        assert_eq!(config.sources.timeout_secs, 10);
    }

    #[test]
    fn test_env_overrides_switch_to_rest_sink() {
        let env: HashMap<&str, &str> = [
            ("SUPABASE_URL", "https://example.supabase.co"),
            ("SUPABASE_KEY", "secret"),
            ("AIRQ_BATCH_SIZE", "25"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.load.batch_size, 25);
        match config.sink {
            SinkConfig::Postgrest { url, api_key } => {
                assert_eq!(url, "https://example.supabase.co");
                assert_eq!(api_key, "secret");
            }
            other => panic!("unexpected sink {:?}", other),
        }
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::from_toml(include_str!("../airq.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.entities.len(), 2);
        assert_eq!(config.features, FeatureConfig::default());
        assert_eq!(config.load.retry.max_retries, 2);
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut config = Config::default();
        config.load.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
