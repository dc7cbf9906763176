//! 内置任务处理器
//!
//! 每种任务类型把负载解析为对应的协作方参数，再调用注入的外部接口。
//! 批量发送按顺序逐条执行，条目之间留出间隔以遵守服务商的发送速率。

use portal_config::TaskQueueConfig;
use portal_domain::{
    DocumentDelivery, DocumentSender, MessageSender, Notification, NotificationSender,
    OutboundMessage, ResourceUpload, ResourceUploader, Task, TaskType, WorkerError, WorkerResult,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::handler::{HandlerRegistry, TaskHandler};

/// 内置处理器依赖的外部接口
#[derive(Clone)]
pub struct MessagingPorts {
    pub messages: Arc<dyn MessageSender>,
    pub notifications: Arc<dyn NotificationSender>,
    pub documents: Arc<dyn DocumentSender>,
    pub uploads: Arc<dyn ResourceUploader>,
}

/// 为所有任务类型注册内置处理器
pub fn register_builtin(
    registry: &mut HandlerRegistry,
    ports: &MessagingPorts,
    config: &TaskQueueConfig,
) {
    registry
        .register(
            TaskType::MessageSend,
            MessageSendHandler {
                sender: Arc::clone(&ports.messages),
            },
        )
        .register(
            TaskType::DocumentSend,
            DocumentSendHandler {
                sender: Arc::clone(&ports.documents),
            },
        )
        .register(
            TaskType::NotificationSend,
            NotificationSendHandler {
                sender: Arc::clone(&ports.notifications),
            },
        )
        .register(
            TaskType::ResourceUpload,
            ResourceUploadHandler {
                uploader: Arc::clone(&ports.uploads),
            },
        )
        .register(
            TaskType::GroupedMessageSend,
            GroupedMessageHandler {
                sender: Arc::clone(&ports.messages),
                delay: config.group_message_delay(),
            },
        )
        .register(
            TaskType::GroupedNotificationSend,
            GroupedNotificationHandler {
                sender: Arc::clone(&ports.notifications),
                delay: config.group_notification_delay(),
            },
        );
}

pub struct MessageSendHandler {
    sender: Arc<dyn MessageSender>,
}

impl TaskHandler for MessageSendHandler {
    fn handle(&self, task: &Task) -> WorkerResult<Value> {
        let message: OutboundMessage = task.payload_as()?;
        debug!(task_id = %task.id, phone_number = %message.phone_number, "发送消息");
        self.sender.send_message(&message)
    }
}

pub struct DocumentSendHandler {
    sender: Arc<dyn DocumentSender>,
}

impl TaskHandler for DocumentSendHandler {
    fn handle(&self, task: &Task) -> WorkerResult<Value> {
        let delivery: DocumentDelivery = task.payload_as()?;
        debug!(task_id = %task.id, recipient = %delivery.recipient, "发送文档");
        self.sender.send_document(&delivery)
    }
}

pub struct NotificationSendHandler {
    sender: Arc<dyn NotificationSender>,
}

impl TaskHandler for NotificationSendHandler {
    fn handle(&self, task: &Task) -> WorkerResult<Value> {
        let notification: Notification = task.payload_as()?;
        debug!(task_id = %task.id, to_email = %notification.to_email, "发送通知");
        self.sender.send_notification(&notification)
    }
}

pub struct ResourceUploadHandler {
    uploader: Arc<dyn ResourceUploader>,
}

impl TaskHandler for ResourceUploadHandler {
    fn handle(&self, task: &Task) -> WorkerResult<Value> {
        let upload: ResourceUpload = task.payload_as()?;
        debug!(task_id = %task.id, record_id = %upload.record_id, "上传资源");
        self.uploader.upload_resource(&upload)
    }
}

pub struct GroupedMessageHandler {
    sender: Arc<dyn MessageSender>,
    delay: Duration,
}

impl TaskHandler for GroupedMessageHandler {
    fn handle(&self, task: &Task) -> WorkerResult<Value> {
        let items = grouped_items(task, "messages")?;
        let results = send_sequentially(task, &items, self.delay, |message: OutboundMessage| {
            let outcome = self.sender.send_message(&message);
            (message.phone_number, outcome)
        });
        Ok(summarize(task, "phone_number", results))
    }
}

pub struct GroupedNotificationHandler {
    sender: Arc<dyn NotificationSender>,
    delay: Duration,
}

impl TaskHandler for GroupedNotificationHandler {
    fn handle(&self, task: &Task) -> WorkerResult<Value> {
        let items = grouped_items(task, "notifications")?;
        let results = send_sequentially(task, &items, self.delay, |notification: Notification| {
            let outcome = self.sender.send_notification(&notification);
            (notification.to_email, outcome)
        });
        Ok(summarize(task, "to_email", results))
    }
}

fn grouped_items(task: &Task, key: &str) -> WorkerResult<Vec<Value>> {
    match task.payload_value(key)? {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(WorkerError::invalid_payload(format!(
            "{} 字段 {key} 不是数组",
            task.id
        ))),
    }
}

/// 逐条发送；单条失败只记录在该条的结果里
fn send_sequentially<T, F>(
    task: &Task,
    items: &[Value],
    delay: Duration,
    mut send: F,
) -> Vec<(Option<String>, WorkerResult<Value>)>
where
    T: DeserializeOwned,
    F: FnMut(T) -> (String, WorkerResult<Value>),
{
    let mut results = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            thread::sleep(delay);
        }
        match serde_json::from_value::<T>(item.clone()) {
            Ok(parsed) => {
                let (recipient, outcome) = send(parsed);
                if let Err(err) = &outcome {
                    warn!(task_id = %task.id, index, recipient = %recipient, "批量发送中的一条失败: {}", err);
                }
                results.push((Some(recipient), outcome));
            }
            Err(e) => {
                warn!(task_id = %task.id, index, "批量发送条目格式错误: {}", e);
                results.push((None, Err(WorkerError::invalid_payload(e.to_string()))));
            }
        }
    }
    results
}

fn summarize(
    task: &Task,
    recipient_field: &str,
    results: Vec<(Option<String>, WorkerResult<Value>)>,
) -> Value {
    let total = results.len();
    let successful = results.iter().filter(|(_, outcome)| outcome.is_ok()).count();
    let items: Vec<Value> = results
        .into_iter()
        .map(|(recipient, outcome)| {
            let mut item = serde_json::Map::new();
            item.insert(recipient_field.to_string(), json!(recipient));
            match outcome {
                Ok(response) => {
                    item.insert("success".into(), json!(true));
                    item.insert("response".into(), response);
                }
                Err(err) => {
                    item.insert("success".into(), json!(false));
                    item.insert("error".into(), json!(err.to_string()));
                }
            }
            Value::Object(item)
        })
        .collect();

    info!(
        task_id = %task.id,
        task_type = %task.task_type,
        total,
        successful,
        "批量发送完成"
    );
    json!({
        "total": total,
        "successful": successful,
        "failed": total - successful,
        "results": items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_domain::{TaskPayload, TaskPriority};
    use portal_testing_utils::RecordingMessaging;

    fn ports(messaging: &Arc<RecordingMessaging>) -> MessagingPorts {
        MessagingPorts {
            messages: messaging.clone(),
            notifications: messaging.clone(),
            documents: messaging.clone(),
            uploads: messaging.clone(),
        }
    }

    fn registry(messaging: &Arc<RecordingMessaging>) -> HandlerRegistry {
        let config = TaskQueueConfig {
            group_message_delay_ms: 0,
            group_notification_delay_ms: 0,
            ..TaskQueueConfig::default()
        };
        let mut registry = HandlerRegistry::new();
        register_builtin(&mut registry, &ports(messaging), &config);
        registry
    }

    fn task(task_type: TaskType, payload: Value) -> Task {
        let payload: TaskPayload = payload.as_object().cloned().unwrap();
        Task::new(task_type, TaskPriority::Medium, payload)
    }

    #[test]
    fn test_all_types_registered() {
        let messaging = Arc::new(RecordingMessaging::new());
        let registry = registry(&messaging);
        for task_type in TaskType::ALL {
            assert!(registry.contains(task_type), "{task_type} 未注册");
        }
    }

    #[test]
    fn test_message_send() {
        let messaging = Arc::new(RecordingMessaging::new());
        let registry = registry(&messaging);

        let task = task(
            TaskType::MessageSend,
            json!({ "phone_number": "+15550001", "message": "hi" }),
        );
        registry.dispatch(&task).unwrap();
        let sent = messaging.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].phone_number, "+15550001");
        assert!(sent[0].media_urls.is_empty());
    }

    #[test]
    fn test_invalid_payload_fails_without_sending() {
        let messaging = Arc::new(RecordingMessaging::new());
        let registry = registry(&messaging);

        let err = registry
            .dispatch(&task(TaskType::MessageSend, json!({ "message": "hi" })))
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidPayload(_)));
        assert!(messaging.messages().is_empty());
    }

    #[test]
    fn test_notification_defaults_recipient_name() {
        let messaging = Arc::new(RecordingMessaging::new());
        let registry = registry(&messaging);

        let task = task(
            TaskType::NotificationSend,
            json!({ "to_email": "a@example.com", "subject": "s", "body": "b" }),
        );
        registry.dispatch(&task).unwrap();
        assert_eq!(messaging.notifications()[0].recipient_name, "Customer");
    }

    #[test]
    fn test_grouped_messages_isolate_failures() {
        let messaging = Arc::new(RecordingMessaging::new());
        messaging.fail_recipient("+2");
        let registry = registry(&messaging);

        let task = task(
            TaskType::GroupedMessageSend,
            json!({ "messages": [
                { "phone_number": "+1", "message": "a" },
                { "phone_number": "+2", "message": "b" },
                { "message": "missing phone" },
                { "phone_number": "+4", "message": "d" },
            ]}),
        );
        let output = registry.dispatch(&task).unwrap();

        assert_eq!(output["total"], json!(4));
        assert_eq!(output["successful"], json!(2));
        assert_eq!(output["failed"], json!(2));
        let results = output["results"].as_array().unwrap();
        assert_eq!(results[0]["success"], json!(true));
        assert_eq!(results[1]["phone_number"], json!("+2"));
        assert_eq!(results[1]["success"], json!(false));
        assert_eq!(results[2]["phone_number"], Value::Null);
        assert_eq!(messaging.messages().len(), 2);
    }

    #[test]
    fn test_grouped_notifications_are_paced() {
        let messaging = Arc::new(RecordingMessaging::new());
        let handler = GroupedNotificationHandler {
            sender: messaging.clone(),
            delay: Duration::from_millis(30),
        };

        let task = task(
            TaskType::GroupedNotificationSend,
            json!({ "notifications": [
                { "to_email": "a@example.com", "subject": "s", "body": "b" },
                { "to_email": "b@example.com", "subject": "s", "body": "b" },
                { "to_email": "c@example.com", "subject": "s", "body": "b" },
            ]}),
        );
        let started = std::time::Instant::now();
        let output = handler.handle(&task).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(output["successful"], json!(3));
        let sent: Vec<String> = messaging
            .notifications()
            .into_iter()
            .map(|n| n.to_email)
            .collect();
        assert_eq!(sent, vec!["a@example.com", "b@example.com", "c@example.com"]);
    }

    #[test]
    fn test_grouped_payload_must_be_array() {
        let messaging = Arc::new(RecordingMessaging::new());
        let registry = registry(&messaging);
        let err = registry
            .dispatch(&task(TaskType::GroupedMessageSend, json!({ "messages": "nope" })))
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidPayload(_)));
    }
}
