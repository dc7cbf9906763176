//! Polling helpers for thread-based components

use std::thread;
use std::time::{Duration, Instant};

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Polls `condition` every 10ms until it holds or `timeout` elapses
    pub fn wait_for<F>(condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        Self::wait_for_with_interval(condition, timeout, Duration::from_millis(10))
    }

    pub fn wait_for_with_interval<F>(
        mut condition: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();
        loop {
            if condition() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(poll_interval);
        }
    }

    /// Polls `poll` until it returns `Some`, or gives up after `timeout`
    pub fn wait_for_value<T, F>(mut poll: F, timeout: Duration) -> Option<T>
    where
        F: FnMut() -> Option<T>,
    {
        let mut value = None;
        Self::wait_for(
            || {
                value = poll();
                value.is_some()
            },
            timeout,
        );
        value
    }

    /// Set up logging for tests (safe to call more than once)
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    }
}
