use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::pattern::glob_match;

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// 进程内存储，过期时间在每次读取时惰性检查
///
/// 每个方法是一个独立的临界区；读改写复合操作只有 `increment` 是原子的。
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key.to_string(), MemoryEntry { value, expires_at });
    }

    /// 覆盖已存在的键并保留其过期时间
    pub fn replace(&self, key: &str, value: String) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                false
            }
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.entries.lock().remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                false
            }
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }
    }

    /// 原子自增；键不存在（或已过期）时以 `amount` 新建并设置过期时间，
    /// 已存在的键不重置过期时间。存储值不是整数时返回 `Err(原值)`。
    pub fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64, String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(key) {
            if !entry.is_expired(now) {
                let current: i64 = entry.value.parse().map_err(|_| entry.value.clone())?;
                let next = current + amount;
                entry.value = next.to_string();
                return Ok(next);
            }
        }

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: amount.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(amount)
    }

    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    pub fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
