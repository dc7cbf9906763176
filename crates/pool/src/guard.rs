use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pool::{HandleFactory, PoolInner};

/// RAII守卫，离开作用域时自动归还连接到池
///
/// 连接出错时调用 [`PooledHandle::discard`] 丢弃，释放名额而不放回空闲队列。
pub struct PooledHandle<F: HandleFactory> {
    handle: Option<F::Handle>,
    created_at: Instant,
    pool: Arc<PoolInner<F>>,
}

impl<F: HandleFactory> PooledHandle<F> {
    pub(crate) fn new(handle: F::Handle, created_at: Instant, pool: Arc<PoolInner<F>>) -> Self {
        Self {
            handle: Some(handle),
            created_at,
            pool,
        }
    }

    /// 连接建立至今的时长
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    /// 丢弃连接，不再放回池中
    pub fn discard(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.forget(handle);
        }
    }

    /// 显式归还，等价于 drop
    pub fn release(self) {}
}

impl<F: HandleFactory> Deref for PooledHandle<F> {
    type Target = F::Handle;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref().expect("handle is present until the guard is consumed")
    }
}

impl<F: HandleFactory> DerefMut for PooledHandle<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handle.as_mut().expect("handle is present until the guard is consumed")
    }
}

impl<F: HandleFactory> Drop for PooledHandle<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.give_back(handle, self.created_at);
        }
    }
}

impl<F: HandleFactory> fmt::Debug for PooledHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("pool", &self.pool.name())
            .field("age", &self.age())
            .finish()
    }
}
