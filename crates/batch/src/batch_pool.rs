use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, RecvTimeoutError, TryRecvError};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use portal_config::{BatchConfig, PoolConfig};
use portal_domain::{
    BatchItemResult, BatchOperation, BatchOperationType, DownloadItem, RecordUpdater,
    StorageClient, StorageConnector, StoredObject, UploadItem, WorkerError, WorkerResult,
};
use portal_pool::{PoolStats, ResourcePool};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::executor::{Executor, Job};
use crate::storage::{ensure_container_path, StorageFactory};

/// 批处理完成回调，在执行器线程上调用一次
pub type BatchCallback = Box<dyn FnOnce(&str, &BatchOperation) + Send + 'static>;

/// 协调线程等待子任务时，两次尝试代为执行排队任务之间的最长间隔
const HELP_INTERVAL: Duration = Duration::from_millis(10);
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Counters {
    batches_submitted: u64,
    total_operations: u64,
    completed_operations: u64,
    failed_operations: u64,
    active_batches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub batches_submitted: u64,
    /// 已提交的子项总数
    pub total_operations: u64,
    pub completed_operations: u64,
    pub failed_operations: u64,
    pub active_batches: usize,
    pub pending_jobs: usize,
    pub workers: usize,
    pub idle_workers: usize,
    pub pool: PoolStats,
}

struct Inner {
    config: BatchConfig,
    executor: Executor,
    clients: ResourcePool<StorageFactory>,
    records: Option<Arc<dyn RecordUpdater>>,
    results: RwLock<HashMap<String, BatchOperation>>,
    counters: Mutex<Counters>,
    // 同一批次的多个子项可能同时解析相同的目录
    container_lock: Mutex<()>,
    accepting: AtomicBool,
}

/// 批量文件上传/下载
///
/// 每个批次由一个协调任务处理：协调任务把每个子项作为独立的任务提交到同一个执行器，
/// 等待全部完成（或超时）后一次性写入结果表。单个子项失败不影响其他子项。
/// 存储客户端来自独立的资源池，大小等于执行器线程数。
pub struct BatchWorkerPool {
    inner: Arc<Inner>,
}

impl BatchWorkerPool {
    pub fn new(
        config: BatchConfig,
        storage: Arc<dyn StorageConnector>,
        records: Option<Arc<dyn RecordUpdater>>,
    ) -> WorkerResult<Self> {
        let pool_config = PoolConfig {
            pool_size: config.max_workers,
            max_overflow: 0,
            acquire_timeout_seconds: config.item_timeout_seconds,
            retry_attempts: 0,
            retry_delay_ms: 0,
            recycle_seconds: 0,
            pre_ping: false,
        };
        let clients = ResourcePool::new("batch-storage", StorageFactory::new(storage), pool_config)?;
        let executor = Executor::new("batch-worker", config.max_workers)?;

        info!(
            workers = config.max_workers,
            item_timeout_secs = config.item_timeout_seconds,
            "批处理工作池已启动"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                executor,
                clients,
                records,
                results: RwLock::new(HashMap::new()),
                counters: Mutex::new(Counters::default()),
                container_lock: Mutex::new(()),
                accepting: AtomicBool::new(true),
            }),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// 提交批量上传，立即返回批次ID
    pub fn submit_uploads(
        &self,
        items: Vec<UploadItem>,
        callback: Option<BatchCallback>,
    ) -> WorkerResult<String> {
        self.submit(BatchOperationType::Upload, items, callback, upload_item)
    }

    /// 提交批量下载，文件写入 `download_dir/{batch_id}/`
    pub fn submit_downloads(
        &self,
        items: Vec<DownloadItem>,
        callback: Option<BatchCallback>,
    ) -> WorkerResult<String> {
        self.submit(BatchOperationType::Download, items, callback, download_item)
    }

    /// 批次完成前返回 None
    pub fn get_batch_result(&self, batch_id: &str) -> Option<BatchOperation> {
        self.inner.results.read().get(batch_id).cloned()
    }

    pub fn require_batch_result(&self, batch_id: &str) -> WorkerResult<BatchOperation> {
        self.get_batch_result(batch_id)
            .ok_or_else(|| WorkerError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })
    }

    /// 取走已完成批次的结果，之后该批次查询不到
    pub fn take_batch_result(&self, batch_id: &str) -> Option<BatchOperation> {
        self.inner.results.write().remove(batch_id)
    }

    pub fn stats(&self) -> BatchStats {
        let counters = self.inner.counters.lock();
        BatchStats {
            batches_submitted: counters.batches_submitted,
            total_operations: counters.total_operations,
            completed_operations: counters.completed_operations,
            failed_operations: counters.failed_operations,
            active_batches: counters.active_batches,
            pending_jobs: self.inner.executor.pending(),
            workers: self.inner.executor.size(),
            idle_workers: self.inner.executor.idle(),
            pool: self.inner.clients.stats(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// 停止接收新批次，等待进行中的批次结束后关闭执行器和存储客户端池
    ///
    /// 最多等待 `item_timeout`，超时后仍未结束的批次由执行器线程自行收尾。
    pub fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("正在关闭批处理工作池");

        let timeout = self.inner.config.item_timeout();
        let deadline = Instant::now() + timeout;
        while self.inner.counters.lock().active_batches > 0 && Instant::now() < deadline {
            thread::sleep(DRAIN_INTERVAL);
        }
        let active = self.inner.counters.lock().active_batches;
        if active > 0 {
            warn!(active, "关闭时仍有批处理未完成");
        }

        self.inner
            .executor
            .shutdown(deadline.saturating_duration_since(Instant::now()));
        self.inner.clients.close();
        info!("批处理工作池已关闭");
    }

    #[instrument(skip(self, items, callback, process), fields(items = items.len()))]
    fn submit<T, P>(
        &self,
        operation_type: BatchOperationType,
        items: Vec<T>,
        callback: Option<BatchCallback>,
        process: P,
    ) -> WorkerResult<String>
    where
        T: Send + 'static,
        P: Fn(&Inner, &str, usize, T) -> WorkerResult<Value> + Send + Sync + 'static,
    {
        if !self.is_running() {
            return Err(WorkerError::Shutdown("批处理工作池已关闭".to_string()));
        }
        let batch_id = format!("batch_{operation_type}_{}", Uuid::new_v4().simple());
        let total = items.len();
        let submitted_at = Utc::now();
        self.inner.track_submitted(total as u64);

        let inner = Arc::clone(&self.inner);
        let job_batch_id = batch_id.clone();
        let process = Arc::new(process);
        let job: Job = Box::new(move || {
            let operation =
                coordinate(&inner, &job_batch_id, operation_type, submitted_at, items, process);
            inner.complete(operation, callback);
        });

        if let Err(err) = self.inner.executor.submit(job) {
            self.inner.track_rejected(total as u64);
            return Err(err);
        }

        info!(batch_id = %batch_id, operation = %operation_type, total, "批处理已提交");
        Ok(batch_id)
    }
}

impl Drop for BatchWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn track_submitted(&self, items: u64) {
        let mut counters = self.counters.lock();
        counters.batches_submitted += 1;
        counters.total_operations += items;
        counters.active_batches += 1;
        gauge!("batch_active").set(counters.active_batches as f64);
    }

    fn track_rejected(&self, items: u64) {
        let mut counters = self.counters.lock();
        counters.batches_submitted -= 1;
        counters.total_operations -= items;
        counters.active_batches -= 1;
        gauge!("batch_active").set(counters.active_batches as f64);
    }

    /// 写入结果表后再调用回调，结果只写一次
    fn complete(&self, operation: BatchOperation, callback: Option<BatchCallback>) {
        {
            let mut counters = self.counters.lock();
            counters.active_batches -= 1;
            counters.completed_operations += operation.successful as u64;
            counters.failed_operations += operation.failed as u64;
            gauge!("batch_active").set(counters.active_batches as f64);
        }

        let batch_id = operation.batch_id.clone();
        self.results
            .write()
            .entry(batch_id.clone())
            .or_insert_with(|| operation.clone());

        info!(
            batch_id = %batch_id,
            status = ?operation.status,
            total = operation.total,
            successful = operation.successful,
            failed = operation.failed,
            "批处理完成"
        );

        if let Some(callback) = callback {
            let invoked =
                panic::catch_unwind(AssertUnwindSafe(|| callback(batch_id.as_str(), &operation)));
            if invoked.is_err() {
                error!(batch_id = %batch_id, "批处理回调 panic");
            }
        }
    }

    fn upload(&self, client: &mut dyn StorageClient, item: &UploadItem) -> WorkerResult<StoredObject> {
        let container_id = {
            let _resolving = self.container_lock.lock();
            ensure_container_path(
                client,
                &item.parent_container,
                &[item.client_id.as_str(), item.member_name.as_str()],
            )?
        };
        client.upload(&container_id, &item.filename, &item.content, item.mime_type())
    }
}

/// 提交所有子项并等待结果
///
/// 执行器没有空闲线程时，协调线程会代为执行排队的任务；
/// 截止时间前未完成的子项记为失败。
fn coordinate<T, P>(
    inner: &Arc<Inner>,
    batch_id: &str,
    operation_type: BatchOperationType,
    submitted_at: DateTime<Utc>,
    items: Vec<T>,
    process: Arc<P>,
) -> BatchOperation
where
    T: Send + 'static,
    P: Fn(&Inner, &str, usize, T) -> WorkerResult<Value> + Send + Sync + 'static,
{
    let total = items.len();
    let (tx, rx) = unbounded::<BatchItemResult>();

    for (index, item) in items.into_iter().enumerate() {
        let tx = tx.clone();
        let job_inner = Arc::clone(inner);
        let process = Arc::clone(&process);
        let item_batch_id = batch_id.to_string();
        let job: Job = Box::new(move || {
            let result = run_item(&job_inner, &item_batch_id, index, item, process.as_ref());
            let _ = tx.send(result);
        });
        if let Err(err) = inner.executor.submit(job) {
            error!(batch_id, index, "提交批处理子项失败: {}", err);
            return BatchOperation::aborted(
                batch_id.to_string(),
                operation_type,
                submitted_at,
                total,
                err.to_string(),
            );
        }
    }
    drop(tx);

    let deadline = Instant::now() + inner.config.item_timeout();
    let mut slots: Vec<Option<BatchItemResult>> = vec![None; total];
    let mut resolved = 0;
    while resolved < total {
        let next = match rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                if inner.executor.idle() == 0 && inner.executor.run_pending() {
                    continue;
                }
                match rx.recv_timeout((deadline - now).min(HELP_INTERVAL)) {
                    Ok(result) => Some(result),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        };
        if let Some(result) = next {
            let index = result.index;
            if slots[index].replace(result).is_none() {
                resolved += 1;
            }
        }
    }

    if resolved < total {
        warn!(
            batch_id,
            unresolved = total - resolved,
            timeout_secs = inner.config.item_timeout_seconds,
            "部分子项未在超时内完成"
        );
    }
    let items = slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| {
                BatchItemResult::failed(
                    index,
                    format!("子项未在 {}s 内完成", inner.config.item_timeout_seconds),
                )
            })
        })
        .collect();
    BatchOperation::from_items(batch_id.to_string(), operation_type, submitted_at, items)
}

fn run_item<T, P>(inner: &Inner, batch_id: &str, index: usize, item: T, process: &P) -> BatchItemResult
where
    P: Fn(&Inner, &str, usize, T) -> WorkerResult<Value>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || process(inner, batch_id, index, item)))
        .unwrap_or_else(|_| Err(WorkerError::execution("批处理子项 panic")));
    match outcome {
        Ok(output) => {
            counter!("batch_items_total", "outcome" => "success").increment(1);
            debug!(batch_id, index, "批处理子项完成");
            BatchItemResult::succeeded(index, output)
        }
        Err(err) => {
            counter!("batch_items_total", "outcome" => "failure").increment(1);
            warn!(batch_id, index, "批处理子项失败: {}", err);
            BatchItemResult::failed(index, err.to_string())
        }
    }
}

fn upload_item(inner: &Inner, batch_id: &str, index: usize, item: UploadItem) -> WorkerResult<Value> {
    let missing = item.missing_fields();
    if !missing.is_empty() {
        return Err(WorkerError::invalid_payload(format!(
            "缺少必填字段: {}",
            missing.join(", ")
        )));
    }

    let mut client = inner.clients.get()?;
    let uploaded = inner.upload(&mut **client, &item);
    if matches!(&uploaded, Err(err) if err.is_connection_related()) {
        client.discard();
    } else {
        client.release();
    }
    let object = uploaded?;

    let path = format!("{}/{}/{}", item.client_id, item.member_name, item.filename);
    if let (Some(record_id), Some(records)) = (item.record_id.as_deref(), inner.records.as_ref()) {
        // 回写失败不影响上传结果
        if let Err(err) = records.record_upload(record_id, &object, &path) {
            warn!(batch_id, index, record_id, "回写业务记录失败: {}", err);
        }
    }

    Ok(json!({
        "file_id": object.id,
        "file_name": object.name,
        "web_url": object.web_url,
        "size": object.size,
        "path": path,
    }))
}

fn download_item(
    inner: &Inner,
    batch_id: &str,
    _index: usize,
    item: DownloadItem,
) -> WorkerResult<Value> {
    if item.resource_id.trim().is_empty() {
        return Err(WorkerError::invalid_payload("缺少必填字段: resource_id"));
    }
    let local_name = Path::new(item.local_name())
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            WorkerError::invalid_payload(format!("无效的文件名: {}", item.local_name()))
        })?;

    let mut client = inner.clients.get()?;
    let downloaded = client.download(&item.resource_id);
    if matches!(&downloaded, Err(err) if err.is_connection_related()) {
        client.discard();
    } else {
        client.release();
    }
    let content = downloaded?;

    let dir = inner.config.download_dir().join(batch_id);
    fs::create_dir_all(&dir)
        .map_err(|e| WorkerError::Internal(format!("无法创建目录 {}: {e}", dir.display())))?;
    let path = dir.join(&local_name);
    fs::write(&path, &content)
        .map_err(|e| WorkerError::Internal(format!("无法写入 {}: {e}", path.display())))?;

    Ok(json!({
        "resource_id": item.resource_id,
        "path": path.display().to_string(),
        "size": content.len(),
    }))
}
