use chrono::{DateTime, Utc};
use portal_batch::BatchStats;
use portal_cache::{CacheBackend, CacheReport};
use portal_pool::PoolStats;
use portal_queue::QueueStats;
use serde::Serialize;

/// 连接池借出比例达到该值时视为降级
pub const POOL_SATURATION_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// 数据存储不可用或队列已停止为 unhealthy；
    /// 缓存回退到进程内存储或连接池接近饱和为 degraded
    pub fn assess(core_available: bool, cache_fallback: bool, pool_utilization: f64) -> Self {
        if !core_available {
            HealthStatus::Unhealthy
        } else if cache_fallback || pool_utilization >= POOL_SATURATION_THRESHOLD {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// 存活/就绪探针使用的 HTTP 状态码
    pub fn http_status(&self) -> u16 {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => 200,
            HealthStatus::Unhealthy => 503,
        }
    }
}

/// 运维健康报告
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub queue: QueueStats,
    pub pool: PoolStats,
    pub pool_detail: String,
    pub cache_backend: CacheBackend,
    pub cache: CacheReport,
    pub batch: BatchStats,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assess() {
        assert_eq!(HealthStatus::assess(true, false, 0.2), HealthStatus::Healthy);
        assert_eq!(HealthStatus::assess(true, true, 0.2), HealthStatus::Degraded);
        assert_eq!(HealthStatus::assess(true, false, 0.9), HealthStatus::Degraded);
        assert_eq!(HealthStatus::assess(false, false, 0.0), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::assess(false, true, 1.0), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_http_status() {
        assert_eq!(HealthStatus::Degraded.http_status(), 200);
        assert_eq!(HealthStatus::Unhealthy.http_status(), 503);
    }
}
