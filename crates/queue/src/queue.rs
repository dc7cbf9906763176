use crossbeam_channel::{bounded, Receiver, Sender};
use metrics::{counter, gauge};
use parking_lot::{Condvar, Mutex, RwLock};
use portal_config::TaskQueueConfig;
use portal_domain::{
    Task, TaskCallback, TaskPayload, TaskPriority, TaskResult, TaskSnapshot, TaskStatus,
    TaskType, WorkerError, WorkerResult,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::handler::HandlerRegistry;
use crate::retry::RetryTimer;

/// 第 `retry_count` 次失败后的等待时间：`backoff_unit × min(2^retry_count, max_backoff_seconds)`
pub fn backoff_delay(config: &TaskQueueConfig, retry_count: u32) -> Duration {
    let factor = 2u64
        .checked_pow(retry_count)
        .unwrap_or(u64::MAX)
        .min(config.max_backoff_seconds);
    config
        .backoff_unit()
        .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
}

#[derive(Default)]
struct PendingQueues {
    queues: [VecDeque<Task>; 3],
    shutdown: bool,
}

impl PendingQueues {
    /// 严格按优先级出队：高优先级队列非空时不会取低优先级任务
    fn pop_next(&mut self) -> Option<Task> {
        self.queues.iter_mut().find_map(|queue| queue.pop_front())
    }

    fn sizes(&self) -> [usize; 3] {
        [
            self.queues[0].len(),
            self.queues[1].len(),
            self.queues[2].len(),
        ]
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_tasks: u64,
    completed_tasks: u64,
    failed_tasks: u64,
    retried_tasks: u64,
    active_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub retried_tasks: u64,
    pub active_workers: usize,
    pub workers: usize,
    /// 按优先级 1、2、3 排列
    pub queue_sizes: [usize; 3],
    pub total_queue_size: usize,
    pub pending_retries: usize,
    pub dead_letter_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub status: QueueState,
    pub message: String,
    pub stats: QueueStats,
}

struct Shared {
    config: TaskQueueConfig,
    registry: HandlerRegistry,
    pending: Mutex<PendingQueues>,
    available: Condvar,
    counters: Mutex<Counters>,
    results: RwLock<HashMap<String, TaskResult>>,
    /// 未到终态的任务；终态结果写入结果表之后才移除
    in_flight: Mutex<HashMap<String, TaskStatus>>,
    dead_letters: Mutex<VecDeque<TaskSnapshot>>,
}

/// 优先级任务队列
///
/// 三个独立的 FIFO 队列按 1 → 2 → 3 的顺序出队，由固定数量的工作线程执行。
/// 失败的任务交给重试定时器，按指数退避重新进入原优先级队列；
/// 重试耗尽后进入死信队列。终态结果写入结果表，回调至多调用一次。
pub struct TaskQueue {
    shared: Arc<Shared>,
    timer: Arc<RetryTimer>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    exited: Receiver<usize>,
}

impl TaskQueue {
    pub fn start(config: TaskQueueConfig, registry: HandlerRegistry) -> WorkerResult<Self> {
        if config.max_workers == 0 {
            return Err(WorkerError::config_error("task_queue.max_workers 必须大于 0"));
        }

        let shared = Arc::new(Shared {
            config,
            registry,
            pending: Mutex::new(PendingQueues::default()),
            available: Condvar::new(),
            counters: Mutex::new(Counters::default()),
            results: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(VecDeque::new()),
        });

        let timer_shared = Arc::clone(&shared);
        let timer = Arc::new(RetryTimer::start(move |task| timer_shared.requeue(task))?);

        let worker_count = shared.config.max_workers;
        let (exit_tx, exited) = bounded(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let worker_shared = Arc::clone(&shared);
            let worker_timer = Arc::clone(&timer);
            let exit_tx: Sender<usize> = exit_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("task-worker-{worker_id}"))
                .spawn(move || {
                    worker_loop(&worker_shared, &worker_timer, worker_id);
                    let _ = exit_tx.send(worker_id);
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!("启动工作线程 {} 失败: {}", worker_id, e);
                    let queue = Self {
                        shared,
                        timer,
                        workers: Mutex::new(workers),
                        exited,
                    };
                    queue.shutdown();
                    return Err(WorkerError::Internal(format!("无法启动工作线程: {e}")));
                }
            }
        }

        info!(
            workers = worker_count,
            capacity = shared.config.max_queue_size,
            handlers = shared.registry.len(),
            "任务队列已启动"
        );

        Ok(Self {
            shared,
            timer,
            workers: Mutex::new(workers),
            exited,
        })
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    /// 提交任务，返回任务ID
    ///
    /// 目标优先级队列已满时返回 `QueueFull`，由调用方决定如何处理背压。
    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type, priority = %task.priority))]
    pub fn enqueue(&self, task: Task) -> WorkerResult<String> {
        let task_id = task.id.clone();
        let priority = task.priority;
        let capacity = self.shared.config.max_queue_size;

        let depth = {
            let mut pending = self.shared.pending.lock();
            if pending.shutdown {
                return Err(WorkerError::Shutdown("任务队列已关闭".to_string()));
            }
            let queue = &mut pending.queues[priority.index()];
            if queue.len() >= capacity {
                counter!("task_queue_rejected_total", "priority" => priority.to_string())
                    .increment(1);
                warn!("优先级 {} 队列已满 ({})，拒绝任务", priority, capacity);
                return Err(WorkerError::QueueFull {
                    priority: priority.level(),
                    capacity,
                });
            }
            queue.push_back(task);
            let depth = queue.len();
            self.shared
                .in_flight
                .lock()
                .insert(task_id.clone(), TaskStatus::Queued);
            depth
        };

        self.shared.counters.lock().total_tasks += 1;
        self.shared.available.notify_one();

        counter!("task_queue_enqueued_total", "priority" => priority.to_string()).increment(1);
        gauge!("task_queue_depth", "priority" => priority.to_string()).set(depth as f64);
        debug!(depth, "任务已入队");
        Ok(task_id)
    }

    /// 按类型创建任务并入队，最大重试次数取自配置
    pub fn enqueue_task(
        &self,
        task_type: TaskType,
        payload: TaskPayload,
        priority: TaskPriority,
        callback: Option<TaskCallback>,
    ) -> WorkerResult<String> {
        let mut task =
            Task::new(task_type, priority, payload).with_max_retries(self.shared.config.max_retries);
        if let Some(callback) = callback {
            task = task.with_callback(callback);
        }
        self.enqueue(task)
    }

    /// 入队并返回一个在任务终态时收到结果的接收端
    ///
    /// 任务原有的回调仍会先被调用。队列关闭时丢弃的任务会让接收端断开。
    pub fn enqueue_awaitable(&self, mut task: Task) -> WorkerResult<(String, Receiver<TaskResult>)> {
        let (tx, rx) = bounded(1);
        let previous = task.take_callback();
        let task = task.with_callback(move |task: &Task, result: &TaskResult| {
            if let Some(callback) = previous {
                callback(task, result);
            }
            let _ = tx.send(result.clone());
        });
        let task_id = self.enqueue(task)?;
        Ok((task_id, rx))
    }

    pub fn get_task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.shared.results.read().get(task_id).cloned()
    }

    /// 从结果表中取走终态结果，结果表的保留策略由调用方决定
    pub fn remove_task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.shared.results.write().remove(task_id)
    }

    /// 任务当前所处的状态
    ///
    /// 排队中、执行中、等待重试和终态都能查到；未知的任务ID、
    /// 关闭时被丢弃的任务以及结果已被取走的任务返回 `None`。
    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        if let Some(status) = self.shared.in_flight.lock().get(task_id) {
            return Some(*status);
        }
        self.shared
            .results
            .read()
            .get(task_id)
            .map(|result| result.status)
    }

    /// 死信队列快照，最早进入的在前
    pub fn dead_letters(&self) -> Vec<TaskSnapshot> {
        self.shared.dead_letters.lock().iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.pending.lock().shutdown
    }

    pub fn stats(&self) -> QueueStats {
        let queue_sizes = self.shared.pending.lock().sizes();
        let dead_letter_size = self.shared.dead_letters.lock().len();
        let pending_retries = self.timer.pending();
        let counters = self.shared.counters.lock();
        QueueStats {
            total_tasks: counters.total_tasks,
            completed_tasks: counters.completed_tasks,
            failed_tasks: counters.failed_tasks,
            retried_tasks: counters.retried_tasks,
            active_workers: counters.active_workers,
            workers: self.shared.config.max_workers,
            queue_sizes,
            total_queue_size: queue_sizes.iter().sum(),
            pending_retries,
            dead_letter_size,
        }
    }

    pub fn status(&self) -> QueueStatus {
        let stats = self.stats();
        if self.is_running() {
            QueueStatus {
                status: QueueState::Running,
                message: format!(
                    "任务队列运行中，{} 个任务排队，{} 个正在执行",
                    stats.total_queue_size, stats.active_workers
                ),
                stats,
            }
        } else {
            QueueStatus {
                status: QueueState::Stopped,
                message: "任务队列已关闭".to_string(),
                stats,
            }
        }
    }

    /// 停止接收任务并等待工作线程退出
    ///
    /// 排队中和等待重试的任务直接丢弃；超过 `shutdown_timeout` 仍未退出的
    /// 工作线程不再等待。可重复调用。
    pub fn shutdown(&self) {
        let dropped = {
            let mut pending = self.shared.pending.lock();
            if pending.shutdown {
                return;
            }
            pending.shutdown = true;
            let dropped: usize = pending.sizes().iter().sum();
            for queue in pending.queues.iter_mut() {
                queue.clear();
            }
            // 正在执行的任务仍会写入结果
            self.shared
                .in_flight
                .lock()
                .retain(|_, status| *status == TaskStatus::Running);
            dropped
        };
        self.shared.available.notify_all();
        let dropped_retries = self.timer.stop().len();

        let mut workers = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + self.shared.config.shutdown_timeout();
        let mut exited = 0;
        while exited < workers.len() {
            match self.exited.recv_deadline(deadline) {
                Ok(_) => exited += 1,
                Err(_) => break,
            }
        }

        let mut detached = 0;
        for handle in workers.drain(..) {
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("工作线程异常退出");
                }
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            warn!("{} 个工作线程在关闭超时内未退出", detached);
        }

        for priority in TaskPriority::ALL {
            gauge!("task_queue_depth", "priority" => priority.to_string()).set(0.0);
        }
        info!(dropped, dropped_retries, "任务队列已关闭");
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared, timer: &RetryTimer, worker_id: usize) {
    debug!(worker_id, "工作线程已启动");
    loop {
        let (task, depth) = {
            let mut pending = shared.pending.lock();
            loop {
                if pending.shutdown {
                    debug!(worker_id, "工作线程退出");
                    return;
                }
                if let Some(task) = pending.pop_next() {
                    shared
                        .in_flight
                        .lock()
                        .insert(task.id.clone(), TaskStatus::Running);
                    let depth = pending.queues[task.priority.index()].len();
                    break (task, depth);
                }
                shared
                    .available
                    .wait_for(&mut pending, shared.config.poll_interval());
            }
        };
        gauge!("task_queue_depth", "priority" => task.priority.to_string()).set(depth as f64);
        shared.execute(task, timer);
    }
}

impl Shared {
    fn execute(&self, mut task: Task, timer: &RetryTimer) {
        self.counters.lock().active_workers += 1;
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.registry.dispatch(&task)))
            .unwrap_or_else(|payload| {
                Err(WorkerError::execution(format!(
                    "处理器 panic: {}",
                    panic_message(payload.as_ref())
                )))
            });
        self.counters.lock().active_workers -= 1;

        match outcome {
            Ok(output) => {
                debug!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    attempt = task.retry_count + 1,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "任务执行成功"
                );
                self.counters.lock().completed_tasks += 1;
                counter!("task_queue_completed_total", "task_type" => task.task_type.as_str())
                    .increment(1);
                let result = TaskResult::completed(&task, output);
                self.finish(task, result);
            }
            Err(err) => {
                task.retry_count += 1;
                if task.can_retry() {
                    let delay = backoff_delay(&self.config, task.retry_count);
                    warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        attempt = task.retry_count,
                        max_retries = task.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "任务执行失败，等待重试: {}",
                        err
                    );
                    self.counters.lock().retried_tasks += 1;
                    counter!("task_queue_retries_total", "task_type" => task.task_type.as_str())
                        .increment(1);
                    // 先标记再交给定时器，定时器可能立刻把任务放回队列
                    self.in_flight
                        .lock()
                        .insert(task.id.clone(), TaskStatus::RetryScheduled);
                    if let Err(task) = timer.schedule(task, delay) {
                        self.in_flight.lock().remove(&task.id);
                        warn!(task_id = %task.id, "队列正在关闭，放弃重试");
                    }
                } else {
                    error!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        attempts = task.retry_count,
                        "任务重试耗尽，进入死信队列: {}",
                        err
                    );
                    self.counters.lock().failed_tasks += 1;
                    counter!("task_queue_failed_total", "task_type" => task.task_type.as_str())
                        .increment(1);
                    self.push_dead_letter(task.snapshot(Some(err.to_string())));
                    let result = TaskResult::failed(&task, err.to_string());
                    self.finish(task, result);
                }
            }
        }
    }

    /// 写入结果表并调用回调，两者对每个任务都只发生一次
    fn finish(&self, mut task: Task, result: TaskResult) {
        self.results
            .write()
            .entry(task.id.clone())
            .or_insert_with(|| result.clone());
        self.in_flight.lock().remove(&task.id);

        if let Some(callback) = task.take_callback() {
            let invoked = panic::catch_unwind(AssertUnwindSafe(|| callback(&task, &result)));
            if let Err(payload) = invoked {
                error!(
                    task_id = %task.id,
                    "任务回调 panic: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    fn push_dead_letter(&self, snapshot: TaskSnapshot) {
        let mut dead_letters = self.dead_letters.lock();
        dead_letters.push_back(snapshot);
        while dead_letters.len() > self.config.dead_letter_capacity {
            if let Some(evicted) = dead_letters.pop_front() {
                debug!(task_id = %evicted.task_id, "死信队列已满，移除最早的任务");
            }
        }
    }

    /// 重试任务回到原优先级队列，不受容量限制，也不重复计入 total_tasks
    fn requeue(&self, task: Task) {
        let mut pending = self.pending.lock();
        if pending.shutdown {
            self.in_flight.lock().remove(&task.id);
            debug!(task_id = %task.id, "队列已关闭，丢弃重试任务");
            return;
        }
        debug!(task_id = %task.id, attempt = task.retry_count + 1, "重试任务重新入队");
        self.in_flight
            .lock()
            .insert(task.id.clone(), TaskStatus::Queued);
        pending.queues[task.priority.index()].push_back(task);
        drop(pending);
        self.available.notify_one();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
