use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use portal_errors::{WorkerError, WorkerResult};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 固定大小的线程池，线程从同一个通道里取任务
///
/// 正在等待子任务的调用方可以通过 `run_pending` 在自己的线程上执行排队的任务，
/// 因此协调任务占满所有线程时也不会死锁。
pub struct Executor {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// 阻塞在通道上等待任务的线程数
    idle: Arc<AtomicUsize>,
    size: usize,
}

impl Executor {
    pub fn new(name: &str, size: usize) -> WorkerResult<Self> {
        if size == 0 {
            return Err(WorkerError::config_error(format!("{name}: 线程数必须大于 0")));
        }

        let (sender, receiver) = unbounded::<Job>();
        let executor = Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Vec::with_capacity(size)),
            idle: Arc::new(AtomicUsize::new(0)),
            size,
        };

        for index in 0..size {
            let receiver = executor.receiver.clone();
            let idle = Arc::clone(&executor.idle);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || loop {
                    idle.fetch_add(1, Ordering::SeqCst);
                    let next = receiver.recv();
                    idle.fetch_sub(1, Ordering::SeqCst);
                    match next {
                        Ok(job) => run_job(job),
                        Err(_) => break,
                    }
                });
            match spawned {
                Ok(handle) => executor.workers.lock().push(handle),
                Err(e) => {
                    executor.shutdown(Duration::from_secs(1));
                    return Err(WorkerError::Internal(format!("无法启动 {name} 线程: {e}")));
                }
            }
        }

        info!("执行器 {} 已启动，{} 个线程", name, size);
        Ok(executor)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn submit(&self, job: Job) -> WorkerResult<()> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| WorkerError::Shutdown(format!("执行器 {} 已关闭", self.name))),
            None => Err(WorkerError::Shutdown(format!("执行器 {} 已关闭", self.name))),
        }
    }

    /// 在当前线程上执行一个排队的任务；没有任务时返回 false
    pub fn run_pending(&self) -> bool {
        match self.receiver.try_recv() {
            Ok(job) => {
                run_job(job);
                true
            }
            Err(_) => false,
        }
    }

    /// 当前空闲的线程数；为 0 时排队的任务只能靠调用方代为执行
    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// 停止接收新任务；已排队的任务仍会执行完，最多等待 `timeout`
    pub fn shutdown(&self, timeout: Duration) {
        if self.sender.lock().take().is_none() {
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline && !workers.iter().all(JoinHandle::is_finished) {
            thread::sleep(Duration::from_millis(10));
        }

        let mut detached = 0;
        for handle in workers {
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("执行器 {} 的线程异常退出", self.name);
                }
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            warn!("执行器 {} 有 {} 个线程未在 {:?} 内退出", self.name, detached, timeout);
        }
        debug!("执行器 {} 已关闭", self.name);
    }
}

fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("执行器任务 panic: {}", message);
    }
}
