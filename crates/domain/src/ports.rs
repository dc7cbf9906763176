//! 外部协作方接口
//!
//! 消息服务、对象存储、业务数据库等客户端的具体实现不在本系统内，
//! 这里只定义以普通数据为输入输出的调用边界，由启动代码注入。

use portal_errors::WorkerResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub phone_number: String,
    pub message: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub to_email: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default = "default_recipient_name")]
    pub recipient_name: String,
}

fn default_recipient_name() -> String {
    "Customer".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDelivery {
    pub document: Value,
    pub recipient: String,
    #[serde(default = "default_true")]
    pub send_email: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUpload {
    pub file: Value,
    pub record_id: String,
    pub client_id: String,
    pub member_name: String,
}

/// 存储中的对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub web_url: Option<String>,
}

pub trait MessageSender: Send + Sync {
    fn send_message(&self, message: &OutboundMessage) -> WorkerResult<Value>;
}

pub trait NotificationSender: Send + Sync {
    fn send_notification(&self, notification: &Notification) -> WorkerResult<Value>;
}

pub trait DocumentSender: Send + Sync {
    fn send_document(&self, delivery: &DocumentDelivery) -> WorkerResult<Value>;
}

pub trait ResourceUploader: Send + Sync {
    fn upload_resource(&self, upload: &ResourceUpload) -> WorkerResult<Value>;
}

/// 对象存储客户端，由批处理的客户端池独占租用
pub trait StorageClient: Send {
    /// 在父容器下按名称查找子容器
    fn find_container(&mut self, parent_id: &str, name: &str) -> WorkerResult<Option<String>>;

    fn create_container(&mut self, parent_id: &str, name: &str) -> WorkerResult<String>;

    fn upload(
        &mut self,
        container_id: &str,
        filename: &str,
        content: &[u8],
        mime_type: &str,
    ) -> WorkerResult<StoredObject>;

    fn download(&mut self, resource_id: &str) -> WorkerResult<Vec<u8>>;

    fn ping(&mut self) -> WorkerResult<()> {
        Ok(())
    }
}

pub trait StorageConnector: Send + Sync {
    fn connect(&self) -> WorkerResult<Box<dyn StorageClient>>;
}

/// 上传完成后回写业务记录
pub trait RecordUpdater: Send + Sync {
    fn record_upload(
        &self,
        record_id: &str,
        object: &StoredObject,
        container_path: &str,
    ) -> WorkerResult<()>;
}

/// 后端数据存储会话
pub trait DatastoreSession: Send {
    fn execute(&mut self, request: &Value) -> WorkerResult<Value>;

    fn ping(&mut self) -> WorkerResult<()>;
}

pub trait DatastoreConnector: Send + Sync {
    fn connect(&self) -> WorkerResult<Box<dyn DatastoreSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_defaults() {
        let n: Notification = serde_json::from_value(json!({
            "to_email": "a@example.com",
            "subject": "Policy",
            "body": "<p>hi</p>"
        }))
        .unwrap();
        assert_eq!(n.recipient_name, "Customer");
        assert!(n.attachments.is_empty());
    }

    #[test]
    fn test_document_delivery_defaults_to_email() {
        let d: DocumentDelivery = serde_json::from_value(json!({
            "document": {"id": "doc-1"},
            "recipient": "+15550001"
        }))
        .unwrap();
        assert!(d.send_email);
    }
}
