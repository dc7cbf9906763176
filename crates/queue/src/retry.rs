use parking_lot::{Condvar, Mutex};
use portal_domain::{Task, WorkerError, WorkerResult};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

struct Scheduled {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap 是大顶堆，反转后最早到期的在堆顶
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Scheduled>,
    seq: u64,
    stopped: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// 重试定时器：单个线程按到期时间依次把任务交还给队列
pub(crate) struct RetryTimer {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RetryTimer {
    pub(crate) fn start<F>(on_due: F) -> WorkerResult<Self>
    where
        F: Fn(Task) + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("task-retry-timer".to_string())
            .spawn(move || run(thread_shared, on_due))
            .map_err(|e| WorkerError::Internal(format!("无法启动重试定时器: {e}")))?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// 安排任务在 `delay` 之后重新入队；定时器已停止时把任务原样退回
    pub(crate) fn schedule(&self, task: Task, delay: Duration) -> Result<(), Task> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(task);
        }
        state.seq += 1;
        let seq = state.seq;
        state.heap.push(Scheduled {
            due: Instant::now() + delay,
            seq,
            task,
        });
        drop(state);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    pub(crate) fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// 停止定时器线程，返回尚未到期的任务
    pub(crate) fn stop(&self) -> Vec<Task> {
        let remaining = {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            std::mem::take(&mut state.heap)
        };
        self.shared.wakeup.notify_all();

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                debug!("重试定时器线程异常退出");
            }
        }
        remaining.into_iter().map(|scheduled| scheduled.task).collect()
    }
}

fn run<F>(shared: Arc<TimerShared>, on_due: F)
where
    F: Fn(Task),
{
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            break;
        }

        let next_due = state.heap.peek().map(|top| top.due);
        match next_due {
            None => shared.wakeup.wait(&mut state),
            Some(due) if due <= Instant::now() => {
                if let Some(scheduled) = state.heap.pop() {
                    trace!(task_id = %scheduled.task.id, "重试任务到期");
                    // 回调会获取队列的锁，先释放定时器的锁
                    parking_lot::MutexGuard::unlocked(&mut state, || on_due(scheduled.task));
                }
            }
            Some(due) => {
                shared.wakeup.wait_until(&mut state, due);
            }
        }
    }
    debug!("重试定时器已停止");
}
