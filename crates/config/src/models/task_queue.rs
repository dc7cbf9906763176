use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 优先级任务队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueConfig {
    /// 工作线程数
    pub max_workers: usize,
    /// 每个优先级队列的容量
    pub max_queue_size: usize,
    /// 任务默认的最大重试次数
    pub max_retries: u32,
    /// 指数退避上限（秒）
    pub max_backoff_seconds: u64,
    /// 退避计算的时间单位（毫秒），2^n 乘以该单位
    pub backoff_unit_ms: u64,
    /// 工作线程空闲时的等待间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 死信队列容量
    pub dead_letter_capacity: usize,
    /// 批量消息之间的发送间隔（毫秒）
    pub group_message_delay_ms: u64,
    /// 批量通知之间的发送间隔（毫秒）
    pub group_notification_delay_ms: u64,
    /// 关闭时等待工作线程退出的时间（秒）
    pub shutdown_timeout_seconds: u64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 15,
            max_queue_size: 2000,
            max_retries: 3,
            max_backoff_seconds: 60,
            backoff_unit_ms: 1000,
            poll_interval_ms: 100,
            dead_letter_capacity: 1000,
            group_message_delay_ms: 500,
            group_notification_delay_ms: 1000,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl TaskQueueConfig {
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn group_message_delay(&self) -> Duration {
        Duration::from_millis(self.group_message_delay_ms)
    }

    pub fn group_notification_delay(&self) -> Duration {
        Duration::from_millis(self.group_notification_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

impl ConfigValidator for TaskQueueConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(self.max_workers, "task_queue.max_workers", 256)?;
        ValidationUtils::validate_count(self.max_queue_size, "task_queue.max_queue_size", 1_000_000)?;
        ValidationUtils::validate_count(
            self.dead_letter_capacity,
            "task_queue.dead_letter_capacity",
            1_000_000,
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.max_backoff_seconds,
            "task_queue.max_backoff_seconds",
        )?;
        if self.backoff_unit_ms == 0 || self.poll_interval_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "task_queue.backoff_unit_ms and poll_interval_ms must be greater than 0"
                    .to_string(),
            ));
        }
        if self.max_retries > 100 {
            return Err(crate::ConfigError::Validation(
                "task_queue.max_retries must be less than or equal to 100".to_string(),
            ));
        }
        Ok(())
    }
}

/// 批量文件操作配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// 执行线程数，同时也是存储客户端池的大小
    pub max_workers: usize,
    /// 协调线程等待单个批次全部子任务的时间（秒）
    pub item_timeout_seconds: u64,
    /// 下载文件的落盘目录，缺省为系统临时目录
    pub download_dir: Option<PathBuf>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            item_timeout_seconds: 300,
            download_dir: None,
        }
    }
}

impl BatchConfig {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_seconds)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl ConfigValidator for BatchConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(self.max_workers, "batch.max_workers", 256)?;
        ValidationUtils::validate_timeout_seconds(
            self.item_timeout_seconds,
            "batch.item_timeout_seconds",
        )?;
        Ok(())
    }
}
