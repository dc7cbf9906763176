use anyhow::Context;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    cache::{CacheConfig, RateLimitConfig, SessionConfig},
    pool::PoolConfig,
    task_queue::{BatchConfig, TaskQueueConfig},
};
use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

/// 运维端点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8090".to_string(),
        }
    }
}

impl ConfigValidator for ServerConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_bind_address(&self.bind_address, "server.bind_address")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub task_queue: TaskQueueConfig,
    pub batch: BatchConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// 加载配置：TOML文件（可选）→ PORTAL_ 前缀环境变量 → 校验
    ///
    /// 环境变量使用双下划线分隔层级，例如 `PORTAL_POOL__POOL_SIZE=4`。
    pub fn load(config_path: Option<&str>) -> ConfigResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(ConfigError::File(format!("配置文件不存在: {path}")));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/portal-workers.toml", "portal-workers.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("PORTAL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> ConfigResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// 面向2-4个并发用户的小规模部署参数
    pub fn small_deployment() -> Self {
        Self {
            pool: PoolConfig {
                pool_size: 3,
                max_overflow: 2,
                acquire_timeout_seconds: 30,
                retry_attempts: 2,
                ..PoolConfig::default()
            },
            task_queue: TaskQueueConfig {
                max_workers: 3,
                max_queue_size: 100,
                max_retries: 2,
                ..TaskQueueConfig::default()
            },
            batch: BatchConfig {
                max_workers: 2,
                item_timeout_seconds: 60,
                ..BatchConfig::default()
            },
            rate_limit: RateLimitConfig {
                api_limit: 50,
                general_limit: 100,
                webhook_limit: 200,
                ..RateLimitConfig::default()
            },
            session: SessionConfig {
                default_ttl_seconds: 1800,
            },
            ..Self::default()
        }
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.cache.validate()?;
        self.task_queue.validate()?;
        self.batch.validate()?;
        self.rate_limit.validate()?;
        self.session.validate()?;
        self.server.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_app_config_default_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind_address, "0.0.0.0:8090");
    }

    #[test]
    fn test_small_deployment_profile() {
        let config = AppConfig::small_deployment();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.pool_size, 3);
        assert_eq!(config.pool.max_overflow, 2);
        assert_eq!(config.task_queue.max_workers, 3);
        assert_eq!(config.task_queue.max_queue_size, 100);
        assert_eq!(config.batch.max_workers, 2);
    }

    #[test]
    fn test_from_toml_partial_sections() {
        let toml_str = r#"
            [pool]
            pool_size = 4
            max_overflow = 1

            [task_queue]
            max_workers = 2

            [cache]
            key_prefix = "portal"
        "#;

        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.pool.pool_size, 4);
        assert_eq!(config.pool.max_overflow, 1);
        // 未指定的字段保留默认值
        assert_eq!(config.pool.acquire_timeout_seconds, 45);
        assert_eq!(config.task_queue.max_workers, 2);
        assert_eq!(config.task_queue.max_queue_size, 2000);
        assert_eq!(config.cache.key_prefix.as_deref(), Some("portal"));
    }

    #[test]
    fn test_from_toml_invalid_values() {
        let toml_str = r#"
            [pool]
            pool_size = 0
        "#;
        let result = AppConfig::from_toml(toml_str);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[batch]
max_workers = 6
item_timeout_seconds = 120

[server]
bind_address = "127.0.0.1:9100"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.batch.max_workers, 6);
        assert_eq!(config.batch.item_timeout_seconds, 120);
        assert_eq!(config.server.bind_address, "127.0.0.1:9100");
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[batch\nmax_workers = ").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let result = AppConfig::load(Some(&path));
        assert!(matches!(result, Err(ConfigError::Configuration(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = AppConfig::load(Some("/nonexistent/portal-workers.toml"));
        assert!(matches!(result, Err(ConfigError::File(_))));
    }
}
