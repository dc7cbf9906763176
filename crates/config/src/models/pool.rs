use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 外部数据存储连接池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 启动时预先建立的连接数，同时也是空闲队列的容量
    pub pool_size: usize,
    /// 超出 pool_size 后允许按需创建的额外连接数
    pub max_overflow: usize,
    /// 获取连接的最长等待时间（秒）
    pub acquire_timeout_seconds: u64,
    /// with_retry 的默认重试次数
    pub retry_attempts: u32,
    /// 非连接类错误的固定重试间隔（毫秒）
    pub retry_delay_ms: u64,
    /// 空闲连接超过该时长后在取出时重建（秒，0表示不回收）
    pub recycle_seconds: u64,
    /// 取出连接前是否做健康检查
    pub pre_ping: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 15,
            max_overflow: 30,
            acquire_timeout_seconds: 45,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            recycle_seconds: 1800, // 30分钟
            pre_ping: true,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn recycle_after(&self) -> Option<Duration> {
        (self.recycle_seconds > 0).then(|| Duration::from_secs(self.recycle_seconds))
    }

    /// 同时存活连接数的上限
    pub fn max_connections(&self) -> usize {
        self.pool_size + self.max_overflow
    }
}

impl ConfigValidator for PoolConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(self.pool_size, "pool.pool_size", 1000)?;
        if self.max_overflow > 1000 {
            return Err(crate::ConfigError::Validation(
                "pool.max_overflow must be less than or equal to 1000".to_string(),
            ));
        }
        ValidationUtils::validate_timeout_seconds(
            self.acquire_timeout_seconds,
            "pool.acquire_timeout_seconds",
        )?;
        Ok(())
    }
}
