use metrics::counter;
use parking_lot::Mutex;
use portal_config::CacheConfig;
use portal_errors::{WorkerError, WorkerResult};
use portal_pool::ResourcePool;
use redis::{Connection, RedisResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::memory::MemoryStore;
use crate::redis_backend::{self, RedisConnector};

/// Which store is currently answering cache calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    Redis,
    Memory,
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub backend: CacheBackend,
    /// redis 已配置但当前使用进程内存储
    pub fallback: bool,
    pub keys: usize,
    #[serde(flatten)]
    pub stats: CacheStats,
}

/// Key-value cache with TTL
///
/// Redis is the primary backend. When redis cannot be reached at construction,
/// or a call fails with a connection or timeout error, the cache switches to the
/// in-process [`MemoryStore`] for the rest of its life. The switch is logged
/// once and never surfaces to callers. Running out of pooled connections does
/// not switch backends.
///
/// Every value is stored as JSON text.
pub struct KeyValueCache {
    redis: Option<ResourcePool<RedisConnector>>,
    redis_configured: bool,
    degraded: AtomicBool,
    memory: MemoryStore,
    key_prefix: Option<String>,
    default_ttl: Duration,
    stats: Mutex<CacheStats>,
}

impl KeyValueCache {
    pub fn new(config: &CacheConfig) -> WorkerResult<Self> {
        let redis = match &config.redis_url {
            Some(url) => match redis_backend::connect(url, config) {
                Ok(pool) => {
                    info!("Cache backend: redis");
                    Some(pool)
                }
                Err(e) if config.fallback_to_memory => {
                    warn!("Redis unavailable, using in-memory cache: {}", e);
                    counter!("cache_fallback_total").increment(1);
                    None
                }
                Err(e) => {
                    return Err(WorkerError::Cache(format!(
                        "redis unavailable and memory fallback disabled: {e}"
                    )))
                }
            },
            None => {
                info!("Cache backend: memory");
                None
            }
        };

        Ok(Self {
            redis,
            redis_configured: config.redis_url.is_some(),
            degraded: AtomicBool::new(false),
            memory: MemoryStore::new(),
            key_prefix: config.key_prefix.clone(),
            default_ttl: config.default_ttl(),
            stats: Mutex::new(CacheStats::default()),
        })
    }

    /// Memory-only cache with default settings
    pub fn in_memory() -> Self {
        Self {
            redis: None,
            redis_configured: false,
            degraded: AtomicBool::new(false),
            memory: MemoryStore::new(),
            key_prefix: None,
            default_ttl: CacheConfig::default().default_ttl(),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn backend(&self) -> CacheBackend {
        if self.active_redis().is_some() {
            CacheBackend::Redis
        } else {
            CacheBackend::Memory
        }
    }

    /// Redis was configured but the cache is serving from memory
    pub fn is_fallback(&self) -> bool {
        self.redis_configured && self.backend() == CacheBackend::Memory
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn set<V: Serialize + ?Sized>(&self, key: &str, value: &V, ttl: Option<Duration>) -> bool {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.record_error();
                error!(key, "Cache set error: {}", e);
                return false;
            }
        };
        let full_key = self.full_key(key);
        let ttl_ms = ttl_millis(ttl);

        let stored = match self.on_redis("set", &full_key, |conn| {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&full_key).arg(&encoded);
            if let Some(ms) = ttl_ms {
                cmd.arg("PX").arg(ms);
            }
            cmd.query::<()>(conn)
        }) {
            Some(result) => result.is_ok(),
            None => {
                self.memory.set(&full_key, encoded, ttl.filter(|t| !t.is_zero()));
                true
            }
        };
        if stored {
            self.stats.lock().sets += 1;
        }
        stored
    }

    /// Overwrites an existing key, keeping its TTL. Returns false if the key is absent.
    pub fn replace<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> bool {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.record_error();
                error!(key, "Cache replace error: {}", e);
                return false;
            }
        };
        let full_key = self.full_key(key);

        let replaced = match self.on_redis("replace", &full_key, |conn| {
            redis::cmd("SET")
                .arg(&full_key)
                .arg(&encoded)
                .arg("KEEPTTL")
                .arg("XX")
                .query::<Option<String>>(conn)
        }) {
            Some(result) => matches!(result, Ok(Some(_))),
            None => self.memory.replace(&full_key, encoded),
        };
        if replaced {
            self.stats.lock().sets += 1;
        }
        replaced
    }

    /// Reads a value, auto-detecting its representation
    pub fn get(&self, key: &str) -> Option<Value> {
        let full_key = self.full_key(key);
        let raw = match self.on_redis("get", &full_key, |conn| {
            redis::cmd("GET").arg(&full_key).query::<Option<String>>(conn)
        }) {
            Some(result) => result.ok().flatten(),
            None => self.memory.get(&full_key),
        };

        let mut stats = self.stats.lock();
        match raw {
            Some(raw) => {
                stats.hits += 1;
                Some(decode(raw))
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                debug!(key, "Cached value has unexpected shape: {}", e);
                None
            }
        }
    }

    /// 读缓存，未命中时调用 `compute` 计算并写回
    ///
    /// `compute` 返回的错误直接交给调用方，不会写入缓存。写回失败只记日志。
    pub fn get_or_compute<T, F>(&self, key: &str, ttl: Option<Duration>, compute: F) -> WorkerResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> WorkerResult<T>,
    {
        if let Some(cached) = self.get_as::<T>(key) {
            return Ok(cached);
        }
        let value = compute()?;
        if !self.set(key, &value, ttl) {
            warn!(key, "Computed value was not cached");
        }
        Ok(value)
    }

    pub fn delete(&self, key: &str) -> bool {
        let full_key = self.full_key(key);
        let deleted = match self.on_redis("delete", &full_key, |conn| {
            redis::cmd("DEL").arg(&full_key).query::<i64>(conn)
        }) {
            Some(result) => result.map(|n| n > 0).unwrap_or(false),
            None => self.memory.delete(&full_key),
        };
        if deleted {
            self.stats.lock().deletes += 1;
        }
        deleted
    }

    pub fn exists(&self, key: &str) -> bool {
        let full_key = self.full_key(key);
        match self.on_redis("exists", &full_key, |conn| {
            redis::cmd("EXISTS").arg(&full_key).query::<i64>(conn)
        }) {
            Some(result) => result.map(|n| n > 0).unwrap_or(false),
            None => self.memory.exists(&full_key),
        }
    }

    /// Re-arms the TTL of an existing key
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let full_key = self.full_key(key);
        let ms = ttl.as_millis().max(1) as u64;
        match self.on_redis("expire", &full_key, |conn| {
            redis::cmd("PEXPIRE").arg(&full_key).arg(ms).query::<i64>(conn)
        }) {
            Some(result) => result.map(|n| n > 0).unwrap_or(false),
            None => self.memory.expire(&full_key, ttl),
        }
    }

    /// Atomically adds `amount` to an integer counter and returns the new value.
    ///
    /// When the key does not exist yet and `ttl` is given, the TTL is attached on
    /// creation only; later increments never extend it. A non-integer value
    /// yields `0`.
    pub fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> i64 {
        let full_key = self.full_key(key);
        let ttl_ms = ttl_millis(ttl);

        let result = match self.on_redis("increment", &full_key, |conn| match ttl_ms {
            Some(ms) => redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(&full_key)
                .arg(0)
                .arg("PX")
                .arg(ms)
                .arg("NX")
                .ignore()
                .cmd("INCRBY")
                .arg(&full_key)
                .arg(amount)
                .query::<(i64,)>(conn)
                .map(|(count,)| count),
            None => redis::cmd("INCRBY")
                .arg(&full_key)
                .arg(amount)
                .query::<i64>(conn),
        }) {
            Some(result) => result.map_err(|e| e.to_string()),
            None => self
                .memory
                .increment(&full_key, amount, ttl.filter(|t| !t.is_zero()))
                .map_err(|current| {
                    self.record_error();
                    format!("value is not an integer: {current}")
                }),
        };

        match result {
            Ok(count) => count,
            Err(reason) => {
                error!(key, "Cache increment error: {}", reason);
                0
            }
        }
    }

    /// Keys matching a glob pattern (`*`, `?`, `[...]`), without the key prefix
    pub fn scan(&self, pattern: &str) -> Vec<String> {
        let full_pattern = self.full_key(pattern);
        let mut keys = match self.on_redis("scan", &full_pattern, |conn| {
            redis::cmd("KEYS").arg(&full_pattern).query::<Vec<String>>(conn)
        }) {
            Some(result) => result.unwrap_or_default(),
            None => self.memory.keys(&full_pattern),
        };
        keys.sort();
        keys.into_iter().map(|key| self.strip_prefix(key)).collect()
    }

    /// Deletes every key starting with `prefix`; returns the number removed
    pub fn flush_prefix(&self, prefix: &str) -> usize {
        let full_prefix = self.full_key(prefix);
        if self.active_redis().is_some() {
            let keys = self.scan(&format!("{}*", escape_glob(prefix)));
            return keys.iter().filter(|key| self.delete(key)).count();
        }
        let removed = self.memory.delete_prefix(&full_prefix);
        self.stats.lock().deletes += removed as u64;
        removed
    }

    /// Purges expired in-memory entries. Redis expires keys on its own.
    pub fn clear_expired(&self) -> usize {
        let cleared = self.memory.clear_expired();
        if cleared > 0 {
            info!("Cleared {} expired cache items", cleared);
        }
        cleared
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    pub fn report(&self) -> CacheReport {
        let keys = match self.on_redis("dbsize", "", |conn| redis::cmd("DBSIZE").query::<usize>(conn)) {
            Some(result) => result.unwrap_or(0),
            None => self.memory.len(),
        };
        CacheReport {
            backend: self.backend(),
            fallback: self.is_fallback(),
            keys,
            stats: self.stats(),
        }
    }

    /// Releases redis connections; the cache keeps answering from memory.
    pub fn close(&self) {
        if let Some(pool) = &self.redis {
            pool.close();
        }
        self.degraded.store(true, Ordering::Release);
    }

    fn active_redis(&self) -> Option<&ResourcePool<RedisConnector>> {
        if self.degraded.load(Ordering::Acquire) {
            return None;
        }
        self.redis.as_ref()
    }

    /// Runs a command against redis.
    ///
    /// `None` means the caller must use the memory store: redis is not in use,
    /// or this call just hit a connection-class failure and the cache degraded.
    /// A busy connection pool is not a redis failure: the call is counted as an
    /// error and answered with the operation's default.
    fn on_redis<T, Op>(&self, operation: &str, key: &str, op: Op) -> Option<WorkerResult<T>>
    where
        Op: FnOnce(&mut Connection) -> RedisResult<T>,
    {
        let pool = self.active_redis()?;
        let mut conn = match pool.get() {
            Ok(conn) => conn,
            Err(e) if e.is_connection_related() => {
                self.degrade(operation, &e);
                return None;
            }
            Err(e) => {
                self.record_error();
                counter!("cache_busy_total", "operation" => operation.to_string()).increment(1);
                warn!(operation, key, "No redis connection available: {}", e);
                return Some(Err(e));
            }
        };

        match op(&mut conn) {
            Ok(value) => Some(Ok(value)),
            Err(e) => {
                let err = WorkerError::from(e);
                if err.is_connection_related() {
                    conn.discard();
                    self.degrade(operation, &err);
                    None
                } else {
                    self.record_error();
                    warn!(operation, key, "Cache command failed: {}", err);
                    Some(Err(err))
                }
            }
        }
    }

    fn degrade(&self, operation: &str, err: &WorkerError) {
        self.record_error();
        if !self.degraded.swap(true, Ordering::AcqRel) {
            counter!("cache_fallback_total").increment(1);
            error!(
                operation,
                "Redis failed, cache switched to in-memory storage: {}", err
            );
        }
    }

    fn record_error(&self) {
        self.stats.lock().errors += 1;
    }

    fn full_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        }
    }

    fn strip_prefix(&self, key: String) -> String {
        match &self.key_prefix {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .map(str::to_string)
                .unwrap_or(key),
            None => key,
        }
    }
}

fn decode(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn ttl_millis(ttl: Option<Duration>) -> Option<u64> {
    ttl.filter(|t| !t.is_zero())
        .map(|t| t.as_millis().max(1) as u64)
}

pub(crate) fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
