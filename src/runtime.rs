use metrics::gauge;
use parking_lot::Mutex;
use portal_batch::{BatchCallback, BatchWorkerPool};
use portal_cache::{KeyValueCache, RateLimiter, SessionStore};
use portal_config::{AppConfig, ConfigValidator};
use portal_domain::{
    BatchOperation, DatastoreConnector, DatastoreSession, DocumentSender, DownloadItem,
    MessageSender, NotificationSender, RecordUpdater, ResourceUploader, StorageConnector,
    TaskCallback, TaskPayload, TaskPriority, TaskResult, TaskStatus, TaskType, UploadItem,
    WorkerError, WorkerResult,
};
use portal_pool::{HandleFactory, PooledHandle, ResourcePool};
use portal_queue::{register_builtin, HandlerRegistry, MessagingPorts, TaskQueue};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::health::{HealthReport, HealthStatus};

/// 健康检查租用数据存储连接的最长等待
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// 运行时依赖的外部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub messages: Arc<dyn MessageSender>,
    pub notifications: Arc<dyn NotificationSender>,
    pub documents: Arc<dyn DocumentSender>,
    pub uploads: Arc<dyn ResourceUploader>,
    pub storage: Arc<dyn StorageConnector>,
    pub records: Option<Arc<dyn RecordUpdater>>,
    pub datastore: Arc<dyn DatastoreConnector>,
}

impl Collaborators {
    fn messaging(&self) -> MessagingPorts {
        MessagingPorts {
            messages: Arc::clone(&self.messages),
            notifications: Arc::clone(&self.notifications),
            documents: Arc::clone(&self.documents),
            uploads: Arc::clone(&self.uploads),
        }
    }
}

/// 数据存储会话工厂
pub struct DatastoreFactory {
    connector: Arc<dyn DatastoreConnector>,
}

impl DatastoreFactory {
    pub fn new(connector: Arc<dyn DatastoreConnector>) -> Self {
        Self { connector }
    }
}

impl HandleFactory for DatastoreFactory {
    type Handle = Box<dyn DatastoreSession>;

    fn create(&self) -> WorkerResult<Box<dyn DatastoreSession>> {
        self.connector.connect()
    }

    fn is_healthy(&self, session: &mut Box<dyn DatastoreSession>) -> bool {
        session.ping().is_ok()
    }
}

pub type DatastoreHandle = PooledHandle<DatastoreFactory>;

/// 任务执行与资源池化子系统
///
/// 启动时按依赖顺序显式构建：数据存储连接池、缓存、限流器与会话存储、任务队列、批处理池。
/// 关闭时按相反顺序释放。所有组件通过引用注入给调用方，不使用全局状态。
pub struct WorkerRuntime {
    config: AppConfig,
    datastore: ResourcePool<DatastoreFactory>,
    cache: Arc<KeyValueCache>,
    rate_limiter: RateLimiter,
    sessions: SessionStore,
    queue: TaskQueue,
    batch: BatchWorkerPool,
    stopped: Mutex<bool>,
}

impl WorkerRuntime {
    /// 构建全部组件
    ///
    /// 配置无效或数据存储连接池一个连接都建不起来时返回错误，这是唯一允许中止启动的情况。
    pub fn start(config: AppConfig, collaborators: Collaborators) -> WorkerResult<Self> {
        config.validate()?;
        info!("正在启动任务执行运行时");

        let datastore = ResourcePool::new(
            "datastore",
            DatastoreFactory::new(Arc::clone(&collaborators.datastore)),
            config.pool.clone(),
        )?;

        let cache = Arc::new(KeyValueCache::new(&config.cache)?);
        let rate_limiter = RateLimiter::new(Arc::clone(&cache), config.rate_limit.clone());
        let sessions = SessionStore::new(Arc::clone(&cache), config.session.default_ttl());

        let mut registry = HandlerRegistry::new();
        register_builtin(&mut registry, &collaborators.messaging(), &config.task_queue);
        let queue = TaskQueue::start(config.task_queue.clone(), registry)?;

        let batch = BatchWorkerPool::new(
            config.batch.clone(),
            Arc::clone(&collaborators.storage),
            collaborators.records.clone(),
        )?;

        info!(
            pool_size = config.pool.pool_size,
            queue_workers = config.task_queue.max_workers,
            batch_workers = config.batch.max_workers,
            cache_backend = ?cache.backend(),
            "任务执行运行时已启动"
        );

        Ok(Self {
            config,
            datastore,
            cache,
            rate_limiter,
            sessions,
            queue,
            batch,
            stopped: Mutex::new(false),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn batch(&self) -> &BatchWorkerPool {
        &self.batch
    }

    pub fn cache(&self) -> &Arc<KeyValueCache> {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn datastore(&self) -> &ResourcePool<DatastoreFactory> {
        &self.datastore
    }

    // ---- 任务 ----

    pub fn enqueue_task(
        &self,
        task_type: TaskType,
        payload: TaskPayload,
        priority: TaskPriority,
        callback: Option<TaskCallback>,
    ) -> WorkerResult<String> {
        self.queue.enqueue_task(task_type, payload, priority, callback)
    }

    pub fn task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.queue.get_task_result(task_id)
    }

    /// 取走任务结果，结果表不会自动清理
    pub fn remove_task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.queue.remove_task_result(task_id)
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.queue.task_status(task_id)
    }

    // ---- 批处理 ----

    pub fn submit_uploads(
        &self,
        items: Vec<UploadItem>,
        callback: Option<BatchCallback>,
    ) -> WorkerResult<String> {
        self.batch.submit_uploads(items, callback)
    }

    pub fn submit_downloads(
        &self,
        items: Vec<DownloadItem>,
        callback: Option<BatchCallback>,
    ) -> WorkerResult<String> {
        self.batch.submit_downloads(items, callback)
    }

    pub fn batch_result(&self, batch_id: &str) -> Option<BatchOperation> {
        self.batch.get_batch_result(batch_id)
    }

    pub fn take_batch_result(&self, batch_id: &str) -> Option<BatchOperation> {
        self.batch.take_batch_result(batch_id)
    }

    // ---- 缓存与限流 ----

    pub fn cache_get(&self, key: &str) -> Option<Value> {
        self.cache.get(key)
    }

    pub fn cache_set<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
    ) -> bool {
        self.cache.set(key, value, ttl)
    }

    pub fn cache_delete(&self, key: &str) -> bool {
        self.cache.delete(key)
    }

    pub fn cache_increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> i64 {
        self.cache.increment(key, amount, ttl)
    }

    pub fn is_rate_limited(&self, identifier: &str, limit: u64, window_seconds: u64) -> bool {
        self.rate_limiter
            .is_rate_limited(identifier, limit, window_seconds)
    }

    // ---- 数据存储 ----

    /// 租用数据存储会话，`timeout` 为空时使用配置的 acquire_timeout。
    /// 归还方式为 drop 或 `release`。
    pub fn pool_acquire(&self, timeout: Option<Duration>) -> WorkerResult<DatastoreHandle> {
        match timeout {
            Some(timeout) => self.datastore.acquire(timeout),
            None => self.datastore.get(),
        }
    }

    /// 在池化会话上执行请求，连接类错误换一个会话重试
    #[instrument(skip(self, request))]
    pub fn execute(&self, request: &Value) -> WorkerResult<Value> {
        self.datastore.with_retry(
            |session| session.execute(request),
            self.config.pool.retry_attempts,
        )
    }

    // ---- 运维 ----

    pub fn health(&self) -> HealthReport {
        let pool = self.datastore.stats();
        let (pool_ok, pool_detail) = self
            .datastore
            .health_check(HEALTH_PROBE_TIMEOUT, |session| session.ping());
        let cache = self.cache.report();
        let queue = self.queue.stats();

        let status = HealthStatus::assess(
            pool_ok && self.queue.is_running(),
            cache.fallback,
            pool.utilization(),
        );
        gauge!("resource_pool_utilization", "pool" => pool.name.clone()).set(pool.utilization());
        debug!(status = ?status, "健康检查完成");

        HealthReport {
            status,
            pool_detail,
            cache_backend: cache.backend,
            queue,
            pool,
            cache,
            batch: self.batch.stats(),
            checked_at: chrono::Utc::now(),
        }
    }

    /// 按启动的相反顺序关闭，可重复调用
    pub fn shutdown(&self) {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return;
        }
        *stopped = true;

        info!("正在关闭任务执行运行时");
        self.batch.shutdown();
        self.queue.shutdown();
        self.cache.close();
        self.datastore.close();
        info!("任务执行运行时已关闭");
    }

    pub fn is_running(&self) -> bool {
        !*self.stopped.lock()
    }

    pub fn require_batch_result(&self, batch_id: &str) -> WorkerResult<BatchOperation> {
        self.batch_result(batch_id)
            .ok_or_else(|| WorkerError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
