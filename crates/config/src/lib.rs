pub mod models;
pub mod validation;

pub use models::{
    AppConfig, BatchConfig, CacheConfig, PoolConfig, RateLimitConfig, ServerConfig,
    SessionConfig, TaskQueueConfig,
};
pub use validation::{ConfigValidator, ValidationUtils};

/// Configuration error type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration error enumeration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("File error: {0}")]
    File(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<anyhow::Error> for ConfigError {
    fn from(err: anyhow::Error) -> Self {
        ConfigError::Configuration(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<ConfigError> for portal_errors::WorkerError {
    fn from(err: ConfigError) -> Self {
        portal_errors::WorkerError::Configuration(err.to_string())
    }
}
