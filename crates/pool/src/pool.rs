use metrics::{counter, gauge, histogram};
use parking_lot::{Condvar, Mutex, MutexGuard};
use portal_config::PoolConfig;
use portal_errors::{WorkerError, WorkerResult};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::guard::PooledHandle;

/// 池化资源的创建与健康检查
pub trait HandleFactory: Send + Sync + 'static {
    type Handle: Send + 'static;

    fn create(&self) -> WorkerResult<Self::Handle>;

    /// pre_ping 时调用，返回 false 的空闲连接会被丢弃并重建
    fn is_healthy(&self, _handle: &mut Self::Handle) -> bool {
        true
    }
}

struct IdleHandle<H> {
    handle: H,
    created_at: Instant,
}

struct PoolState<H> {
    idle: VecDeque<IdleHandle<H>>,
    /// 空闲 + 借出的连接总数
    live: usize,
    checked_out: usize,
    created: u64,
    discarded: u64,
    exhausted: u64,
    closed: bool,
}

pub(crate) struct PoolInner<F: HandleFactory> {
    name: String,
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Handle>>,
    available: Condvar,
}

/// 资源池统计信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub checked_out: usize,
    pub idle: usize,
    pub created: u64,
    pub discarded: u64,
    pub exhausted: u64,
    pub pool_size: usize,
    pub max_overflow: usize,
}

impl PoolStats {
    pub fn limit(&self) -> usize {
        self.pool_size + self.max_overflow
    }

    /// 借出连接数占上限的比例
    pub fn utilization(&self) -> f64 {
        if self.limit() == 0 {
            return 0.0;
        }
        self.checked_out as f64 / self.limit() as f64
    }
}

/// 有界资源池
///
/// 启动时预建 `pool_size` 个连接；空闲队列为空时按需创建，
/// 同时存活的连接数不超过 `pool_size + max_overflow`。
/// 借出的连接以 [`PooledHandle`] 形式返回，离开作用域时自动归还。
pub struct ResourcePool<F: HandleFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: HandleFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: HandleFactory> ResourcePool<F> {
    /// 创建资源池并预建连接
    ///
    /// 单个连接创建失败只记录日志并缩小初始空闲集；
    /// 一个连接都建不起来时返回 `HandleCreation`，由启动代码处理。
    pub fn new<S: Into<String>>(name: S, factory: F, config: PoolConfig) -> WorkerResult<Self> {
        let name = name.into();
        let mut idle = VecDeque::with_capacity(config.pool_size);
        let mut last_error = None;

        for _ in 0..config.pool_size {
            match factory.create() {
                Ok(handle) => idle.push_back(IdleHandle {
                    handle,
                    created_at: Instant::now(),
                }),
                Err(e) => {
                    warn!(pool = %name, error = %e, "预建连接失败");
                    last_error = Some(e);
                }
            }
        }

        if idle.is_empty() && config.pool_size > 0 {
            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            error!(pool = %name, "资源池初始化失败: {}", reason);
            return Err(WorkerError::HandleCreation(format!(
                "{name}: 无法建立任何连接: {reason}"
            )));
        }

        let created = idle.len();
        info!(
            pool = %name,
            created,
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            "资源池初始化完成"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle,
                    live: created,
                    checked_out: 0,
                    created: created as u64,
                    discarded: 0,
                    exhausted: 0,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// 使用配置中的 acquire_timeout 获取连接
    pub fn get(&self) -> WorkerResult<PooledHandle<F>> {
        self.acquire(self.inner.config.acquire_timeout())
    }

    /// 获取连接
    ///
    /// 顺序：空闲连接 → 未达上限时新建 → 等待归还直到超时。
    /// `timeout` 为零时不阻塞。
    pub fn acquire(&self, timeout: Duration) -> WorkerResult<PooledHandle<F>> {
        let inner = &self.inner;
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let mut state = inner.state.lock();

        loop {
            if state.closed {
                return Err(WorkerError::Shutdown(format!("资源池 {} 已关闭", inner.name)));
            }

            if let Some(IdleHandle {
                mut handle,
                created_at,
            }) = state.idle.pop_front()
            {
                state.checked_out += 1;
                let usable = MutexGuard::unlocked(&mut state, || {
                    inner.validate(&mut handle, created_at)
                });
                if usable {
                    let checked_out = state.checked_out;
                    drop(state);
                    return Ok(self.checkout(handle, created_at, started, checked_out));
                }

                state.checked_out -= 1;
                state.live -= 1;
                state.discarded += 1;
                MutexGuard::unlocked(&mut state, move || drop(handle));
                continue;
            }

            if state.live < inner.config.max_connections() {
                // 先占位再在锁外创建，避免并发创建越过上限
                state.live += 1;
                state.checked_out += 1;
                let created = MutexGuard::unlocked(&mut state, || inner.factory.create());
                match created {
                    Ok(handle) => {
                        state.created += 1;
                        let checked_out = state.checked_out;
                        let overflow = state.live > inner.config.pool_size;
                        drop(state);
                        debug!(pool = %inner.name, overflow, "新建连接");
                        return Ok(self.checkout(handle, Instant::now(), started, checked_out));
                    }
                    Err(e) => {
                        state.live -= 1;
                        state.checked_out -= 1;
                        drop(state);
                        inner.available.notify_one();
                        warn!(pool = %inner.name, error = %e, "按需创建连接失败");
                        return Err(e);
                    }
                }
            }

            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    inner.available.wait_until(&mut state, deadline);
                }
                None => inner.available.wait(&mut state),
                _ => {
                    state.exhausted += 1;
                    let checked_out = state.checked_out;
                    drop(state);

                    let waited_ms = started.elapsed().as_millis() as u64;
                    counter!("resource_pool_exhausted_total", "pool" => inner.name.clone())
                        .increment(1);
                    warn!(
                        pool = %inner.name,
                        checked_out,
                        limit = inner.config.max_connections(),
                        waited_ms,
                        "资源池耗尽"
                    );
                    return Err(WorkerError::PoolExhausted {
                        checked_out,
                        limit: inner.config.max_connections(),
                        waited_ms,
                    });
                }
            }
        }
    }

    /// 显式归还，等价于 drop
    pub fn release(&self, handle: PooledHandle<F>) {
        drop(handle);
    }

    /// 带重试地执行操作
    ///
    /// 共执行 `max_retries + 1` 次。连接、超时、池耗尽类错误丢弃当前连接后重新获取；
    /// 其他错误等待 `retry_delay` 后在同一连接上重试。重试用尽时原样返回最后一次的错误。
    pub fn with_retry<T, Op>(&self, mut op: Op, max_retries: u32) -> WorkerResult<T>
    where
        Op: FnMut(&mut F::Handle) -> WorkerResult<T>,
    {
        let mut lease: Option<PooledHandle<F>> = None;
        let mut attempt: u32 = 0;

        loop {
            let acquired = match lease.take() {
                Some(handle) => Ok(handle),
                None => self.get(),
            };

            let err = match acquired {
                Ok(mut handle) => match op(&mut handle) {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        if err.is_transient() {
                            handle.discard();
                        } else {
                            lease = Some(handle);
                        }
                        err
                    }
                },
                Err(err) => err,
            };

            attempt += 1;
            if attempt > max_retries {
                error!(
                    pool = %self.inner.name,
                    attempts = attempt,
                    error = %err,
                    "操作在重试 {} 次后仍然失败", max_retries
                );
                return Err(err);
            }

            warn!(
                pool = %self.inner.name,
                attempt,
                max_retries,
                kind = ?err.kind(),
                error = %err,
                "操作失败，准备重试"
            );
            if !err.is_transient() {
                thread::sleep(self.inner.config.retry_delay());
            }
        }
    }

    /// 租用一个连接执行探测，返回 (是否健康, 描述)
    pub fn health_check<C>(&self, timeout: Duration, check: C) -> (bool, String)
    where
        C: FnOnce(&mut F::Handle) -> WorkerResult<()>,
    {
        match self.acquire(timeout) {
            Ok(mut handle) => match check(&mut handle) {
                Ok(()) => {
                    let stats = self.stats();
                    (
                        true,
                        format!(
                            "{} healthy. checked_out: {}, idle: {}",
                            self.inner.name, stats.checked_out, stats.idle
                        ),
                    )
                }
                Err(e) => {
                    handle.discard();
                    (false, format!("{} unhealthy: {e}", self.inner.name))
                }
            },
            Err(e) => (false, format!("{} unhealthy: {e}", self.inner.name)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            name: self.inner.name.clone(),
            checked_out: state.checked_out,
            idle: state.idle.len(),
            created: state.created,
            discarded: state.discarded,
            exhausted: state.exhausted,
            pool_size: self.inner.config.pool_size,
            max_overflow: self.inner.config.max_overflow,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// 关闭资源池：释放空闲连接，拒绝新的获取请求。
    /// 已借出的连接归还时直接丢弃。
    pub fn close(&self) {
        let drained: Vec<IdleHandle<F::Handle>> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.live -= drained.len();
            state.discarded += drained.len() as u64;
            drained
        };
        self.inner.available.notify_all();
        info!(pool = %self.inner.name, released = drained.len(), "资源池已关闭");
    }

    fn checkout(
        &self,
        handle: F::Handle,
        created_at: Instant,
        started: Instant,
        checked_out: usize,
    ) -> PooledHandle<F> {
        let name = self.inner.name.clone();
        histogram!("resource_pool_acquire_duration_ms", "pool" => name.clone())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        gauge!("resource_pool_checked_out", "pool" => name).set(checked_out as f64);
        PooledHandle::new(handle, created_at, Arc::clone(&self.inner))
    }
}

impl<F: HandleFactory> PoolInner<F> {
    fn validate(&self, handle: &mut F::Handle, created_at: Instant) -> bool {
        if let Some(max_age) = self.config.recycle_after() {
            if created_at.elapsed() >= max_age {
                debug!(pool = %self.name, "连接已超过回收时间，重新创建");
                return false;
            }
        }
        if self.config.pre_ping && !self.factory.is_healthy(handle) {
            warn!(pool = %self.name, "连接健康检查失败，重新创建");
            return false;
        }
        true
    }

    /// 归还连接；空闲队列已满或池已关闭时丢弃
    pub(crate) fn give_back(&self, handle: F::Handle, created_at: Instant) {
        let (surplus, checked_out) = {
            let mut state = self.state.lock();
            state.checked_out -= 1;
            let surplus = if state.closed || state.idle.len() >= self.config.pool_size {
                state.live -= 1;
                state.discarded += 1;
                Some(handle)
            } else {
                state.idle.push_back(IdleHandle { handle, created_at });
                None
            };
            (surplus, state.checked_out)
        };
        self.available.notify_one();
        gauge!("resource_pool_checked_out", "pool" => self.name.clone()).set(checked_out as f64);
        drop(surplus);
    }

    /// 丢弃损坏的连接并释放名额
    pub(crate) fn forget(&self, handle: F::Handle) {
        let checked_out = {
            let mut state = self.state.lock();
            state.checked_out -= 1;
            state.live -= 1;
            state.discarded += 1;
            state.checked_out
        };
        self.available.notify_one();
        gauge!("resource_pool_checked_out", "pool" => self.name.clone()).set(checked_out as f64);
        debug!(pool = %self.name, "连接已丢弃");
        drop(handle);
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}
