use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误类别
///
/// 重试逻辑只看类别，不解析错误消息文本。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 连接断开、拒绝连接等链路问题
    Connection,
    /// 操作或等待超时
    Timeout,
    /// 资源池耗尽
    Exhausted,
    /// 业务逻辑或数据错误，换一个连接也不会成功
    Permanent,
}

impl ErrorKind {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("资源池耗尽: {checked_out}/{limit} 个连接已被占用，等待 {waited_ms}ms 后放弃")]
    PoolExhausted {
        checked_out: usize,
        limit: usize,
        waited_ms: u64,
    },
    #[error("连接错误: {0}")]
    Connection(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("创建连接失败: {0}")]
    HandleCreation(String),
    #[error("队列已满: 优先级 {priority} 队列容量 {capacity}")]
    QueueFull { priority: u8, capacity: usize },
    #[error("未注册的任务处理器: {task_type}")]
    HandlerNotFound { task_type: String },
    #[error("无效的任务参数: {0}")]
    InvalidPayload(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("外部服务错误 ({kind:?}): {message}")]
    External { kind: ErrorKind, message: String },
    #[error("缓存错误: {0}")]
    Cache(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("批处理未找到: {batch_id}")]
    BatchNotFound { batch_id: String },
    #[error("组件已关闭: {0}")]
    Shutdown(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

impl WorkerError {
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }
    pub fn invalid_payload<S: Into<String>>(msg: S) -> Self {
        Self::InvalidPayload(msg.into())
    }
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn external<S: Into<String>>(kind: ErrorKind, msg: S) -> Self {
        Self::External {
            kind,
            message: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Connection(_) | WorkerError::HandleCreation(_) => ErrorKind::Connection,
            WorkerError::Timeout(_) => ErrorKind::Timeout,
            WorkerError::PoolExhausted { .. } => ErrorKind::Exhausted,
            WorkerError::External { kind, .. } => *kind,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// 连接类错误需要丢弃当前句柄重新获取
    pub fn is_connection_related(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Timeout)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Configuration(_) | WorkerError::Internal(_)
        )
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for WorkerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            WorkerError::Timeout(err.to_string())
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
        {
            WorkerError::Connection(err.to_string())
        } else {
            WorkerError::Cache(err.to_string())
        }
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        WorkerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
