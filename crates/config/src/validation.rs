use crate::{ConfigError, ConfigResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that a timeout is reasonable
    pub fn validate_timeout_seconds(timeout_seconds: u64, field_name: &str) -> ConfigResult<()> {
        if timeout_seconds == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if timeout_seconds > 3600 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 3600"
            )));
        }
        Ok(())
    }

    /// Validate that a count is within `1..=max`
    pub fn validate_count(count: usize, field_name: &str, max: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    /// Validate a redis connection URL
    pub fn validate_redis_url(url: &str, field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field_name)?;
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ConfigError::Validation(format!(
                "{field_name} must start with redis:// or rediss://"
            )));
        }
        Ok(())
    }

    /// Validate a `host:port` bind address
    pub fn validate_bind_address(address: &str, field_name: &str) -> ConfigResult<()> {
        address
            .parse::<std::net::SocketAddr>()
            .map(|_| ())
            .map_err(|e| ConfigError::Validation(format!("{field_name} is invalid: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_not_empty() {
        assert!(ValidationUtils::validate_not_empty("test", "field").is_ok());
        assert!(ValidationUtils::validate_not_empty("  test  ", "field").is_ok());
        assert!(ValidationUtils::validate_not_empty("", "field").is_err());
        assert!(ValidationUtils::validate_not_empty("   ", "field").is_err());
    }

    #[test]
    fn test_validate_timeout_seconds() {
        assert!(ValidationUtils::validate_timeout_seconds(30, "t").is_ok());
        assert!(ValidationUtils::validate_timeout_seconds(3600, "t").is_ok());
        assert!(ValidationUtils::validate_timeout_seconds(0, "t").is_err());
        assert!(ValidationUtils::validate_timeout_seconds(3601, "t").is_err());
    }

    #[test]
    fn test_validate_count() {
        assert!(ValidationUtils::validate_count(10, "test", 100).is_ok());
        assert!(ValidationUtils::validate_count(1, "test", 100).is_ok());
        assert!(ValidationUtils::validate_count(100, "test", 100).is_ok());
        assert!(ValidationUtils::validate_count(0, "test", 100).is_err());
        assert!(ValidationUtils::validate_count(101, "test", 100).is_err());
    }

    #[test]
    fn test_validate_redis_url() {
        assert!(ValidationUtils::validate_redis_url("redis://localhost:6379/0", "url").is_ok());
        assert!(ValidationUtils::validate_redis_url("rediss://cache.internal:6380", "url").is_ok());
        assert!(ValidationUtils::validate_redis_url("", "url").is_err());
        assert!(ValidationUtils::validate_redis_url("http://localhost:6379", "url").is_err());
    }

    #[test]
    fn test_validate_bind_address() {
        assert!(ValidationUtils::validate_bind_address("0.0.0.0:8090", "bind").is_ok());
        assert!(ValidationUtils::validate_bind_address("localhost", "bind").is_err());
    }
}
