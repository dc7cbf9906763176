use portal_config::{CacheConfig, PoolConfig};
use portal_errors::WorkerResult;
use portal_pool::{HandleFactory, ResourcePool};
use redis::{Client, Connection};
use std::time::Duration;
use tracing::{debug, info};

/// Opens synchronous redis connections for the cache's connection pool
pub struct RedisConnector {
    client: Client,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl RedisConnector {
    pub fn new(redis_url: &str, config: &CacheConfig) -> WorkerResult<Self> {
        let client = Client::open(redis_url)?;
        Ok(Self {
            client,
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
        })
    }
}

impl HandleFactory for RedisConnector {
    type Handle = Connection;

    fn create(&self) -> WorkerResult<Connection> {
        let mut conn = self.client.get_connection_with_timeout(self.connect_timeout)?;
        conn.set_read_timeout(Some(self.command_timeout))?;
        conn.set_write_timeout(Some(self.command_timeout))?;
        let _: String = redis::cmd("PING").query(&mut conn)?;
        debug!("Opened redis connection");
        Ok(conn)
    }

    fn is_healthy(&self, conn: &mut Connection) -> bool {
        redis::cmd("PING").query::<String>(conn).is_ok()
    }
}

/// Builds the redis connection pool; fails if the first connection cannot be opened.
pub fn connect(redis_url: &str, config: &CacheConfig) -> WorkerResult<ResourcePool<RedisConnector>> {
    info!("Connecting cache to redis at {}", redis_url);
    let connector = RedisConnector::new(redis_url, config)?;
    let pool_config = PoolConfig {
        pool_size: 1,
        max_overflow: config.max_connections.saturating_sub(1),
        acquire_timeout_seconds: config.command_timeout_seconds,
        retry_attempts: 0,
        retry_delay_ms: 0,
        recycle_seconds: 0,
        pre_ping: false,
    };
    ResourcePool::new("redis-cache", connector, pool_config)
}
