use std::path::PathBuf;
use std::time::Duration;

use ext_config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::engine::EngineSettings;
use crate::sources::RetryPolicy;

/// Environment variables such as `STATS_NETWORK__SERVER__HTTP_LISTEN_ADDRESS` override the file.
pub const ENV_PREFIX: &str = "STATS_NETWORK";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StatsNetworkConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
    pub fetch: FetchConfig,
    pub validation: ValidationConfig,
    pub sources: SourcesConfig,
    pub credentials: CredentialsConfig,
    #[serde(skip)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen_address: "127.0.0.1:9085".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".devenv/state/stats-network/stats.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub min_record_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            min_record_interval_secs: 240,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_delay_secs: u64,
    /// 0 disables response caching
    pub cache_ttl_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_attempts: 3,
            backoff_delay_secs: 2,
            cache_ttl_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub threshold: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            threshold: hashrate_stats::DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub network_base_url: String,
    pub apool_base_url: String,
    pub solutions_base_url: String,
    pub minerlab_base_url: String,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            network_base_url: "https://api.qubic.li".to_string(),
            apool_base_url: "https://client.apool.io".to_string(),
            solutions_base_url: "https://pool.qubic.solutions".to_string(),
            minerlab_base_url: "https://minerlab-qubic.azure-api.net/rest/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Static bearer token; takes precedence over username/password login
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub refresh_interval_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            username: None,
            password: None,
            refresh_interval_secs: 3600,
        }
    }
}

impl StatsNetworkConfig {
    /// Load the TOML file at `path` (missing file means defaults) and apply environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::new(path, FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<StatsNetworkConfig>()
    }

    pub fn log_file(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }

    pub fn set_log_file(&mut self, log_file: Option<PathBuf>) {
        self.log_file = log_file;
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_secs.max(1))
    }

    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.credentials.refresh_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.fetch.cache_ttl_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch.max_attempts,
            backoff_delay: Duration::from_secs(self.fetch.backoff_delay_secs),
        }
    }

    /// The per-fetch budget covers every retry attempt and the delays between them.
    pub fn engine_settings(&self) -> EngineSettings {
        let attempts = u64::from(self.fetch.max_attempts.max(1));
        let budget = self
            .fetch
            .timeout_secs
            .saturating_mul(attempts)
            .saturating_add(self.fetch.backoff_delay_secs.saturating_mul(attempts - 1));
        EngineSettings {
            fetch_timeout: Duration::from_secs(budget),
            validation_threshold: self.validation.threshold,
            min_record_interval: Duration::from_secs(self.schedule.min_record_interval_secs),
        }
    }
}
