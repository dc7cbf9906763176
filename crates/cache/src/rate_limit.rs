use metrics::counter;
use portal_config::RateLimitConfig;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::{escape_glob, KeyValueCache};

/// 窗口至少一秒，否则计数键没有过期时间
const MIN_WINDOW_SECONDS: u64 = 1;

/// 限流范围，对应配置中的三档上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Api,
    General,
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub current_count: i64,
    pub window_seconds: u64,
    pub key: String,
}

/// 固定窗口限流器
///
/// 计数键为 `rate_limit:{identifier}:{window_seconds}`，第一次自增时设置过期时间，
/// 过期后重新从零计数。窗口边界处可能在短时间内放行至多 2×limit 个请求。
pub struct RateLimiter {
    cache: Arc<KeyValueCache>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(cache: Arc<KeyValueCache>, config: RateLimitConfig) -> Self {
        Self { cache, config }
    }

    pub fn key(identifier: &str, window_seconds: u64) -> String {
        format!(
            "rate_limit:{identifier}:{}",
            window_seconds.max(MIN_WINDOW_SECONDS)
        )
    }

    /// 匹配该标识所有窗口计数键的模式
    pub fn identity_pattern(identifier: &str) -> String {
        format!("rate_limit:{}:*", escape_glob(identifier))
    }

    /// 计数并判断是否超限；超过 `limit` 次的调用返回 true
    ///
    /// `window_seconds` 为 0 时按 1 秒处理。
    pub fn is_rate_limited(&self, identifier: &str, limit: u64, window_seconds: u64) -> bool {
        let window_seconds = window_seconds.max(MIN_WINDOW_SECONDS);
        let key = Self::key(identifier, window_seconds);
        let count = self
            .cache
            .increment(&key, 1, Some(Duration::from_secs(window_seconds)));
        let limited = count > limit as i64;
        if limited {
            counter!("rate_limit_rejections_total").increment(1);
            debug!(identifier, count, limit, window_seconds, "请求被限流");
        }
        limited
    }

    /// 按配置的档位限流
    pub fn check(&self, scope: RateLimitScope, identifier: &str) -> bool {
        let limit = match scope {
            RateLimitScope::Api => self.config.api_limit,
            RateLimitScope::General => self.config.general_limit,
            RateLimitScope::Webhook => self.config.webhook_limit,
        };
        self.is_rate_limited(identifier, limit, self.config.window_seconds)
    }

    pub fn rate_limit_info(&self, identifier: &str, window_seconds: u64) -> RateLimitInfo {
        let window_seconds = window_seconds.max(MIN_WINDOW_SECONDS);
        let key = Self::key(identifier, window_seconds);
        RateLimitInfo {
            current_count: self.cache.get_as::<i64>(&key).unwrap_or(0),
            window_seconds,
            key,
        }
    }

    pub fn reset(&self, identifier: &str, window_seconds: u64) -> bool {
        self.cache.delete(&Self::key(identifier, window_seconds))
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
