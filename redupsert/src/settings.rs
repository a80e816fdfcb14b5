use crate::collector::BatchPolicy;
use crate::logger::LogLevel;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub store: StoreSettings,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub db_path: String,
    #[serde(default = "default_cache_size_mb")]
    pub db_cache_size_mb: usize,
    #[serde(default)]
    pub batch_policy: BatchPolicy,
}

fn default_cache_size_mb() -> usize { 64 }

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings { db_path: "redupsert.redb".to_string(), db_cache_size_mb: default_cache_size_mb(), batch_policy: BatchPolicy::Whole }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: LogLevel,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings { level: LogLevel::Info }
    }
}

impl AppConfig {
    /// Reads `path` and applies `REDUPSERT__SECTION__KEY` environment overrides.
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path).required(true))
            .add_source(Environment::with_prefix("REDUPSERT").try_parsing(true).separator("__"));
        builder.build()?.try_deserialize()
    }

    /// Applies the log level; call once at startup.
    pub fn init_logging(&self) {
        crate::logger::set_level(self.log.level);
    }
}
