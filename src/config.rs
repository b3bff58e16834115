use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    pub application: ApplicationSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

/// Tuning for the coordinator, lease protocol and reaper.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    /// Namespace for lease keys in the coordination store.
    pub key_prefix: String,
    pub lease_ttl_ms: u64,
    pub max_body_bytes: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long terminal records are kept. The reaper is disabled when unset.
    pub retention_secs: Option<u64>,
    pub reaper_interval_secs: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            key_prefix: "idem".to_string(),
            lease_ttl_ms: 30_000,
            max_body_bytes: 1024 * 1024,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            retention_secs: None,
            reaper_interval_secs: 300,
        }
    }
}

impl IdempotencySettings {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    pub port: u16,
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}
