use portal_cache::{CacheBackend, KeyValueCache, RateLimiter};
use portal_config::{CacheConfig, RateLimitConfig};
use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 假 redis 服务对 GET 的处理方式
#[derive(Clone, Copy)]
enum GetReply {
    /// 等待后返回 nil
    Delayed(Duration),
    /// 直接断开连接
    Hangup,
}

/// 在本地端口启动一个只懂 RESP 基本命令的假 redis，返回连接 URL
fn spawn_fake_redis(get_reply: GetReply) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            thread::spawn(move || serve_fake_redis(stream, get_reply));
        }
    });
    format!("redis://{addr}/0")
}

fn serve_fake_redis(stream: TcpStream, get_reply: GetReply) {
    let Ok(read_half) = stream.try_clone() else { return };
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;
    while let Some(command) = read_command(&mut reader) {
        let name = command.first().map(|c| c.to_ascii_uppercase()).unwrap_or_default();
        let reply: &[u8] = match (name.as_str(), get_reply) {
            ("PING", _) => b"+PONG\r\n",
            ("GET", GetReply::Delayed(delay)) => {
                thread::sleep(delay);
                b"$-1\r\n"
            }
            ("GET", GetReply::Hangup) => return,
            _ => b"+OK\r\n",
        };
        if writer.write_all(reply).is_err() {
            return;
        }
    }
}

fn read_command(reader: &mut impl BufRead) -> Option<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).ok()?;
        data.truncate(len);
        args.push(String::from_utf8_lossy(&data).into_owned());
    }
    Some(args)
}

fn fake_redis_config(url: String) -> CacheConfig {
    CacheConfig {
        redis_url: Some(url),
        max_connections: 1,
        connect_timeout_seconds: 1,
        command_timeout_seconds: 1,
        ..CacheConfig::default()
    }
}

#[test]
fn test_set_then_get_returns_value_unchanged() {
    let cache = KeyValueCache::in_memory();
    let ttl = Some(Duration::from_secs(60));

    let policy = json!({"policy_id": "P-1", "members": ["a", "b"], "premium": 120.5});
    assert!(cache.set("policy", &policy, ttl));
    assert!(cache.set("count", &7, ttl));
    assert!(cache.set("name", "Jordan", ttl));

    assert_eq!(cache.get("policy"), Some(policy));
    assert_eq!(cache.get("count"), Some(json!(7)));
    assert_eq!(cache.get("name"), Some(json!("Jordan")));
}

#[test]
fn test_ttl_expiry_returns_default() {
    let cache = KeyValueCache::in_memory();
    assert!(cache.set("short", "lived", Some(Duration::from_secs(1))));
    assert!(cache.exists("short"));

    thread::sleep(Duration::from_millis(1100));
    assert_eq!(cache.get_or("short", json!("default")), json!("default"));
    assert!(!cache.exists("short"));
    assert!(cache.scan("*").is_empty());
}

#[test]
fn test_concurrent_increment_is_atomic() {
    let cache = Arc::new(KeyValueCache::in_memory());
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..250 {
                    cache.increment("hits", 1, Some(Duration::from_secs(60)));
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(cache.get_as::<i64>("hits"), Some(2000));
}

#[test]
fn test_rate_limiter_fixed_window() {
    let cache = Arc::new(KeyValueCache::in_memory());
    let limiter = RateLimiter::new(cache, RateLimitConfig::default());

    let results: Vec<bool> = (0..6)
        .map(|_| limiter.is_rate_limited("203.0.113.9", 5, 60))
        .collect();
    assert_eq!(results, vec![false, false, false, false, false, true]);
}

#[test]
fn test_rate_limiter_window_elapses() {
    let cache = Arc::new(KeyValueCache::in_memory());
    let limiter = RateLimiter::new(cache, RateLimitConfig::default());

    for _ in 0..6 {
        limiter.is_rate_limited("client", 5, 1);
    }
    assert!(limiter.is_rate_limited("client", 5, 1));

    thread::sleep(Duration::from_millis(1100));
    assert_eq!(limiter.rate_limit_info("client", 1).current_count, 0);
    assert!(!limiter.is_rate_limited("client", 5, 1));
}

#[test]
fn test_busy_connection_pool_keeps_redis_backend() {
    let url = spawn_fake_redis(GetReply::Delayed(Duration::from_millis(900)));
    let cache = Arc::new(KeyValueCache::new(&fake_redis_config(url)).unwrap());
    assert_eq!(cache.backend(), CacheBackend::Redis);

    // 单连接池上的三个慢请求，最后一个等不到连接
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get("k"))
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.join().unwrap(), None);
    }

    assert_eq!(cache.backend(), CacheBackend::Redis);
    assert!(!cache.is_fallback());
    assert_eq!(cache.stats().misses, 3);
}

#[test]
fn test_dropped_redis_connection_falls_back_to_memory() {
    let url = spawn_fake_redis(GetReply::Hangup);
    let cache = KeyValueCache::new(&fake_redis_config(url)).unwrap();
    assert_eq!(cache.backend(), CacheBackend::Redis);

    assert_eq!(cache.get("k"), None);
    assert_eq!(cache.backend(), CacheBackend::Memory);
    assert!(cache.is_fallback());

    assert!(cache.set("k", "v", None));
    assert_eq!(cache.get("k"), Some(json!("v")));
}
