use chrono::{DateTime, Utc};
use portal_errors::{WorkerError, WorkerResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 任务参数，对队列本身是不透明的
pub type TaskPayload = Map<String, Value>;

/// 任务完成回调
///
/// 在工作线程上执行，每个任务至多调用一次，不应阻塞。
pub type TaskCallback = Box<dyn FnOnce(&Task, &TaskResult) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    MessageSend,
    DocumentSend,
    NotificationSend,
    ResourceUpload,
    GroupedMessageSend,
    GroupedNotificationSend,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::MessageSend,
        TaskType::DocumentSend,
        TaskType::NotificationSend,
        TaskType::ResourceUpload,
        TaskType::GroupedMessageSend,
        TaskType::GroupedNotificationSend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::MessageSend => "message_send",
            TaskType::DocumentSend => "document_send",
            TaskType::NotificationSend => "notification_send",
            TaskType::ResourceUpload => "resource_upload",
            TaskType::GroupedMessageSend => "grouped_message_send",
            TaskType::GroupedNotificationSend => "grouped_notification_send",
        }
    }

    /// 任务ID前缀
    pub fn id_prefix(&self) -> &'static str {
        match self {
            TaskType::MessageSend => "msg",
            TaskType::DocumentSend => "doc",
            TaskType::NotificationSend => "notify",
            TaskType::ResourceUpload => "upload",
            TaskType::GroupedMessageSend => "group_msg",
            TaskType::GroupedNotificationSend => "group_notify",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| WorkerError::invalid_payload(format!("未知的任务类型: {s}")))
    }
}

/// 任务优先级，数值越小越先执行
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl TaskPriority {
    /// 按出队顺序排列
    pub const ALL: [TaskPriority; 3] = [TaskPriority::High, TaskPriority::Medium, TaskPriority::Low];

    /// 数值转换，超出范围时退回 Medium
    pub fn from_level(level: u8) -> Self {
        match level {
            1 => TaskPriority::High,
            2 => TaskPriority::Medium,
            3 => TaskPriority::Low,
            _ => TaskPriority::Medium,
        }
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }

    /// 对应队列下标 (0..3)
    pub fn index(&self) -> usize {
        self.level() as usize - 1
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 队列中的任务
///
/// 入队后只由当前持有它的工作线程修改（仅 `retry_count`）。
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub payload: TaskPayload,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    callback: Option<TaskCallback>,
}

impl Task {
    pub fn new(task_type: TaskType, priority: TaskPriority, payload: TaskPayload) -> Self {
        Self {
            id: format!("{}_{}", task_type.id_prefix(), Uuid::new_v4().simple()),
            task_type,
            priority,
            payload,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            callback: None,
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Task, &TaskResult) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// 取出回调，保证只能被调用一次
    pub fn take_callback(&mut self) -> Option<TaskCallback> {
        self.callback.take()
    }

    /// 失败后是否还可以重试
    pub fn can_retry(&self) -> bool {
        self.retry_count <= self.max_retries
    }

    pub fn payload_value(&self, key: &str) -> WorkerResult<&Value> {
        self.payload
            .get(key)
            .ok_or_else(|| WorkerError::invalid_payload(format!("{} 缺少字段 {key}", self.id)))
    }

    pub fn payload_str(&self, key: &str) -> WorkerResult<&str> {
        self.payload_value(key)?
            .as_str()
            .ok_or_else(|| WorkerError::invalid_payload(format!("{} 字段 {key} 不是字符串", self.id)))
    }

    pub fn payload_str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
    }

    pub fn payload_bool(&self, key: &str, default: bool) -> bool {
        self.payload
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// 按字段反序列化整个负载
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> WorkerResult<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| WorkerError::invalid_payload(format!("{}: {e}", self.id)))
    }

    pub fn snapshot(&self, last_error: Option<String>) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            task_type: self.task_type,
            priority: self.priority,
            payload: self.payload.clone(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            created_at: self.created_at,
            last_error,
            recorded_at: Utc::now(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("created_at", &self.created_at)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    RetryScheduled,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 终态任务的结果，写入结果表后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn completed(task: &Task, output: Value) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type,
            status: TaskStatus::Completed,
            output: Some(output),
            error: None,
            // 之前失败的次数加上这次成功
            attempts: task.retry_count + 1,
            finished_at: Utc::now(),
        }
    }

    pub fn failed<S: Into<String>>(task: &Task, error: S) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type,
            status: TaskStatus::Failed,
            output: None,
            error: Some(error.into()),
            attempts: task.retry_count,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// 死信队列中的任务快照（不含回调）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub payload: TaskPayload,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
