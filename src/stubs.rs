//! 服务二进制使用的占位协作方
//!
//! 真实部署中由外部服务提供这些接口；这里只记录调用并返回成功，
//! 让运行时可以在没有外部依赖的情况下启动和自检。

use parking_lot::Mutex;
use portal_domain::{
    DatastoreConnector, DatastoreSession, DocumentDelivery, DocumentSender, ErrorKind,
    MessageSender, Notification, NotificationSender, OutboundMessage, ResourceUpload,
    ResourceUploader, StorageClient, StorageConnector, StoredObject, WorkerError, WorkerResult,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::runtime::Collaborators;

/// 只写日志的消息发送方
pub struct LoggingMessenger;

impl MessageSender for LoggingMessenger {
    fn send_message(&self, message: &OutboundMessage) -> WorkerResult<Value> {
        info!(to = %message.phone_number, media = message.media_urls.len(), "发送短信");
        Ok(json!({ "sid": Uuid::new_v4().simple().to_string(), "status": "queued" }))
    }
}

impl NotificationSender for LoggingMessenger {
    fn send_notification(&self, notification: &Notification) -> WorkerResult<Value> {
        info!(to = %notification.to_email, subject = %notification.subject, "发送邮件通知");
        Ok(json!({ "status": "sent" }))
    }
}

impl DocumentSender for LoggingMessenger {
    fn send_document(&self, delivery: &DocumentDelivery) -> WorkerResult<Value> {
        info!(recipient = %delivery.recipient, email = delivery.send_email, "发送文档");
        Ok(json!({ "status": "sent" }))
    }
}

impl ResourceUploader for LoggingMessenger {
    fn upload_resource(&self, upload: &ResourceUpload) -> WorkerResult<Value> {
        info!(record_id = %upload.record_id, client_id = %upload.client_id, "上传外部资源");
        Ok(json!({ "status": "uploaded", "record_id": upload.record_id }))
    }
}

#[derive(Default)]
struct LocalObjects {
    containers: HashMap<(String, String), String>,
    files: HashMap<String, Vec<u8>>,
}

/// 进程内对象存储
#[derive(Clone, Default)]
pub struct LocalStorage {
    objects: Arc<Mutex<LocalObjects>>,
    sequence: Arc<AtomicU64>,
}

impl StorageConnector for LocalStorage {
    fn connect(&self) -> WorkerResult<Box<dyn StorageClient>> {
        Ok(Box::new(self.clone()))
    }
}

impl StorageClient for LocalStorage {
    fn find_container(&mut self, parent_id: &str, name: &str) -> WorkerResult<Option<String>> {
        let objects = self.objects.lock();
        Ok(objects
            .containers
            .get(&(parent_id.to_string(), name.to_string()))
            .cloned())
    }

    fn create_container(&mut self, parent_id: &str, name: &str) -> WorkerResult<String> {
        let id = format!("folder-{}", self.sequence.fetch_add(1, Ordering::Relaxed) + 1);
        self.objects
            .lock()
            .containers
            .insert((parent_id.to_string(), name.to_string()), id.clone());
        Ok(id)
    }

    fn upload(
        &mut self,
        container_id: &str,
        filename: &str,
        content: &[u8],
        mime_type: &str,
    ) -> WorkerResult<StoredObject> {
        let id = format!("file-{}", self.sequence.fetch_add(1, Ordering::Relaxed) + 1);
        self.objects.lock().files.insert(id.clone(), content.to_vec());
        info!(container_id, filename, mime_type, size = content.len(), "文件已保存");
        Ok(StoredObject {
            web_url: None,
            id,
            name: filename.to_string(),
            size: content.len() as u64,
        })
    }

    fn download(&mut self, resource_id: &str) -> WorkerResult<Vec<u8>> {
        self.objects
            .lock()
            .files
            .get(resource_id)
            .cloned()
            .ok_or_else(|| {
                WorkerError::external(ErrorKind::Permanent, format!("资源不存在: {resource_id}"))
            })
    }
}

/// 回显请求的数据存储
pub struct EchoDatastore;

struct EchoSession;

impl DatastoreConnector for EchoDatastore {
    fn connect(&self) -> WorkerResult<Box<dyn DatastoreSession>> {
        Ok(Box::new(EchoSession))
    }
}

impl DatastoreSession for EchoSession {
    fn execute(&mut self, request: &Value) -> WorkerResult<Value> {
        Ok(json!({ "echo": request }))
    }

    fn ping(&mut self) -> WorkerResult<()> {
        Ok(())
    }
}

pub fn local_collaborators() -> Collaborators {
    let messenger = Arc::new(LoggingMessenger);
    Collaborators {
        messages: messenger.clone(),
        notifications: messenger.clone(),
        documents: messenger.clone(),
        uploads: messenger,
        storage: Arc::new(LocalStorage::default()),
        records: None,
        datastore: Arc::new(EchoDatastore),
    }
}
