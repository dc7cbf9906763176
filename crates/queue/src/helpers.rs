//! 常用任务的入队快捷方法

use portal_domain::{
    DocumentDelivery, Notification, OutboundMessage, ResourceUpload, TaskCallback, TaskPayload,
    TaskPriority, TaskType, WorkerError, WorkerResult,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::queue::TaskQueue;

/// 把参数序列化为任务负载，顶层必须是对象
pub fn to_payload<T: Serialize>(value: &T) -> WorkerResult<TaskPayload> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(WorkerError::invalid_payload(format!(
            "任务负载必须是对象，实际为 {other}"
        ))),
    }
}

impl TaskQueue {
    pub fn send_message_async(
        &self,
        message: &OutboundMessage,
        priority: TaskPriority,
        callback: Option<TaskCallback>,
    ) -> WorkerResult<String> {
        self.enqueue_task(TaskType::MessageSend, to_payload(message)?, priority, callback)
    }

    pub fn send_notification_async(
        &self,
        notification: &Notification,
        priority: TaskPriority,
        callback: Option<TaskCallback>,
    ) -> WorkerResult<String> {
        self.enqueue_task(
            TaskType::NotificationSend,
            to_payload(notification)?,
            priority,
            callback,
        )
    }

    /// 文档发送默认使用高优先级
    pub fn send_document_async(
        &self,
        delivery: &DocumentDelivery,
        priority: Option<TaskPriority>,
        callback: Option<TaskCallback>,
    ) -> WorkerResult<String> {
        self.enqueue_task(
            TaskType::DocumentSend,
            to_payload(delivery)?,
            priority.unwrap_or(TaskPriority::High),
            callback,
        )
    }

    pub fn send_grouped_messages_async(
        &self,
        messages: &[OutboundMessage],
        priority: TaskPriority,
        callback: Option<TaskCallback>,
    ) -> WorkerResult<String> {
        let payload = to_payload(&json!({ "messages": messages }))?;
        self.enqueue_task(TaskType::GroupedMessageSend, payload, priority, callback)
    }

    pub fn send_grouped_notifications_async(
        &self,
        notifications: &[Notification],
        priority: TaskPriority,
        callback: Option<TaskCallback>,
    ) -> WorkerResult<String> {
        let payload = to_payload(&json!({ "notifications": notifications }))?;
        self.enqueue_task(TaskType::GroupedNotificationSend, payload, priority, callback)
    }

    pub fn upload_resource_async(
        &self,
        upload: &ResourceUpload,
        priority: TaskPriority,
        callback: Option<TaskCallback>,
    ) -> WorkerResult<String> {
        self.enqueue_task(TaskType::ResourceUpload, to_payload(upload)?, priority, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_payload_requires_object() {
        let message = OutboundMessage {
            phone_number: "+1".into(),
            message: "hi".into(),
            media_urls: vec![],
        };
        let payload = to_payload(&message).unwrap();
        assert_eq!(payload["phone_number"], json!("+1"));

        assert!(matches!(
            to_payload(&json!([1, 2])),
            Err(WorkerError::InvalidPayload(_))
        ));
    }
}
