//! Test data builders with sensible defaults

use portal_domain::{DownloadItem, Task, TaskPayload, TaskPriority, TaskType, UploadItem};
use serde_json::Value;

/// Builder for queue tasks
pub struct TaskBuilder {
    task_type: TaskType,
    priority: TaskPriority,
    payload: TaskPayload,
    id: Option<String>,
    max_retries: Option<u32>,
}

impl TaskBuilder {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            priority: TaskPriority::Medium,
            payload: TaskPayload::new(),
            id: None,
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    /// Replaces the payload; non-object values are ignored
    pub fn with_payload(mut self, payload: Value) -> Self {
        if let Value::Object(map) = payload {
            self.payload = map;
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn build(self) -> Task {
        let mut task = Task::new(self.task_type, self.priority, self.payload);
        if let Some(id) = self.id {
            task = task.with_id(id);
        }
        if let Some(max_retries) = self.max_retries {
            task = task.with_max_retries(max_retries);
        }
        task
    }
}

/// Builder for batch upload items
pub struct UploadItemBuilder {
    item: UploadItem,
}

impl UploadItemBuilder {
    pub fn new(filename: &str) -> Self {
        Self {
            item: UploadItem {
                content: format!("content of {filename}").into_bytes(),
                filename: filename.to_string(),
                parent_container: "root".to_string(),
                client_id: "client-1".to_string(),
                member_name: "Jane Doe".to_string(),
                mime_type: None,
                record_id: None,
            },
        }
    }

    pub fn with_content(mut self, content: &[u8]) -> Self {
        self.item.content = content.to_vec();
        self
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.item.parent_container = parent.to_string();
        self
    }

    pub fn with_client(mut self, client_id: &str) -> Self {
        self.item.client_id = client_id.to_string();
        self
    }

    pub fn with_member(mut self, member_name: &str) -> Self {
        self.item.member_name = member_name.to_string();
        self
    }

    pub fn with_mime_type(mut self, mime_type: &str) -> Self {
        self.item.mime_type = Some(mime_type.to_string());
        self
    }

    pub fn with_record(mut self, record_id: &str) -> Self {
        self.item.record_id = Some(record_id.to_string());
        self
    }

    pub fn build(self) -> UploadItem {
        self.item
    }
}

/// `count` upload items named `file-1.txt` .. `file-N.txt` for one client and member
pub fn upload_items(count: usize) -> Vec<UploadItem> {
    (1..=count)
        .map(|i| UploadItemBuilder::new(&format!("file-{i}.txt")).build())
        .collect()
}

pub fn download_item(resource_id: &str, filename: Option<&str>) -> DownloadItem {
    DownloadItem {
        resource_id: resource_id.to_string(),
        filename: filename.map(str::to_string),
    }
}
