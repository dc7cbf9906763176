use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Key-value cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis connection URL; `None` keeps the cache in process memory
    pub redis_url: Option<String>,
    /// Namespace prepended to every key as `prefix:key`
    pub key_prefix: Option<String>,
    /// Connection timeout in seconds
    pub connect_timeout_seconds: u64,
    /// Read/write timeout for a single command in seconds
    pub command_timeout_seconds: u64,
    /// Maximum number of pooled redis connections
    pub max_connections: usize,
    /// Fall back to the in-memory map when redis is unreachable
    pub fallback_to_memory: bool,
    /// TTL applied by helpers that do not receive one explicitly
    pub default_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: Some("redis://localhost:6379/0".to_string()),
            key_prefix: None,
            connect_timeout_seconds: 5,
            command_timeout_seconds: 5,
            max_connections: 10,
            fallback_to_memory: true,
            default_ttl_seconds: 600,
        }
    }
}

impl CacheConfig {
    /// Memory-only configuration, used by tests and single-node deployments
    pub fn in_memory() -> Self {
        Self {
            redis_url: None,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }
}

impl ConfigValidator for CacheConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if let Some(url) = &self.redis_url {
            ValidationUtils::validate_redis_url(url, "cache.redis_url")?;
        }
        if let Some(prefix) = &self.key_prefix {
            ValidationUtils::validate_not_empty(prefix, "cache.key_prefix")?;
        }
        ValidationUtils::validate_timeout_seconds(
            self.connect_timeout_seconds,
            "cache.connect_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.command_timeout_seconds,
            "cache.command_timeout_seconds",
        )?;
        ValidationUtils::validate_count(self.max_connections, "cache.max_connections", 1000)?;
        Ok(())
    }
}

/// Fixed-window rate limits applied by the surrounding service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub api_limit: u64,
    pub general_limit: u64,
    pub webhook_limit: u64,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            api_limit: 100,
            general_limit: 200,
            webhook_limit: 1000,
            window_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

impl ConfigValidator for RateLimitConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(self.window_seconds, "rate_limit.window_seconds")?;
        if self.api_limit == 0 || self.general_limit == 0 || self.webhook_limit == 0 {
            return Err(crate::ConfigError::Validation(
                "rate_limit limits must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_ttl_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 7200, // 2 hours
        }
    }
}

impl SessionConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }
}

impl ConfigValidator for SessionConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.default_ttl_seconds == 0 {
            return Err(crate::ConfigError::Validation(
                "session.default_ttl_seconds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
