use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::KeyValueCache;
use crate::rate_limit::RateLimiter;

const SESSION_PREFIX: &str = "session:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// 会话存储，键为 `session:{id}`
pub struct SessionStore {
    cache: Arc<KeyValueCache>,
    default_ttl: Duration,
}

impl SessionStore {
    pub fn new(cache: Arc<KeyValueCache>, default_ttl: Duration) -> Self {
        Self { cache, default_ttl }
    }

    fn key(session_id: &str) -> String {
        format!("{SESSION_PREFIX}{session_id}")
    }

    pub fn create_session(
        &self,
        session_id: &str,
        user_data: Map<String, Value>,
        ttl: Option<Duration>,
    ) -> bool {
        let now = Utc::now();
        let session = Session {
            user_data,
            created_at: now,
            last_activity: now,
        };
        let ttl = ttl.unwrap_or(self.default_ttl);
        debug!(session_id, ttl_secs = ttl.as_secs(), "创建会话");
        self.cache.set(&Self::key(session_id), &session, Some(ttl))
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.cache.get_as(&Self::key(session_id))
    }

    /// 合并用户数据并刷新最后活动时间
    ///
    /// `extend_ttl` 为 true 时重置为默认过期时间，否则保留剩余过期时间。
    pub fn update_session(
        &self,
        session_id: &str,
        user_data: Map<String, Value>,
        extend_ttl: bool,
    ) -> bool {
        let Some(mut session) = self.get_session(session_id) else {
            return false;
        };
        session.user_data.extend(user_data);
        session.last_activity = Utc::now();

        let key = Self::key(session_id);
        if extend_ttl {
            self.cache.set(&key, &session, Some(self.default_ttl))
        } else {
            self.cache.replace(&key, &session)
        }
    }

    pub fn extend_session(&self, session_id: &str, ttl: Option<Duration>) -> bool {
        let Some(mut session) = self.get_session(session_id) else {
            return false;
        };
        session.last_activity = Utc::now();
        self.cache.set(
            &Self::key(session_id),
            &session,
            Some(ttl.unwrap_or(self.default_ttl)),
        )
    }

    pub fn delete_session(&self, session_id: &str) -> bool {
        self.cache.delete(&Self::key(session_id))
    }

    /// 删除该标识的会话及所有限流计数
    pub fn clear_identity(&self, identifier: &str) -> usize {
        let mut removed = usize::from(self.delete_session(identifier));
        for key in self.cache.scan(&RateLimiter::identity_pattern(identifier)) {
            if self.cache.delete(&key) {
                removed += 1;
            }
        }
        info!(identifier, removed, "已清除身份相关缓存");
        removed
    }

    /// 清空所有会话
    pub fn flush(&self) -> usize {
        let removed = self.cache.flush_prefix(SESSION_PREFIX);
        info!(removed, "会话已清空");
        removed
    }
}
