use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperationType {
    Upload,
    Download,
}

impl fmt::Display for BatchOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOperationType::Upload => f.write_str("upload"),
            BatchOperationType::Download => f.write_str("download"),
        }
    }
}

/// 批处理终态
///
/// `Completed` 表示协调线程正常结束（单项失败只计入 `failed`），
/// `Failed` 表示协调本身失败，例如执行器已关闭。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    Failed,
}

/// 待上传的文件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadItem {
    pub content: Vec<u8>,
    pub filename: String,
    /// 顶层容器ID，上传路径为 `parent/client_id/member_name`
    pub parent_container: String,
    pub client_id: String,
    pub member_name: String,
    pub mime_type: Option<String>,
    /// 上传成功后需要回写的业务记录
    pub record_id: Option<String>,
}

impl UploadItem {
    /// 检查必填字段，返回缺失字段名
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.filename.trim().is_empty() {
            missing.push("filename");
        }
        if self.parent_container.trim().is_empty() {
            missing.push("parent_container");
        }
        if self.client_id.trim().is_empty() {
            missing.push("client_id");
        }
        if self.member_name.trim().is_empty() {
            missing.push("member_name");
        }
        missing
    }

    pub fn mime_type(&self) -> &str {
        self.mime_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadItem {
    pub resource_id: String,
    /// 本地文件名，缺省使用资源ID
    pub filename: Option<String>,
}

impl DownloadItem {
    pub fn local_name(&self) -> &str {
        self.filename.as_deref().unwrap_or(&self.resource_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl BatchItemResult {
    pub fn succeeded(index: usize, output: Value) -> Self {
        Self {
            index,
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed<S: Into<String>>(index: usize, error: S) -> Self {
        Self {
            index,
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// 调用方可见的批处理结果，协调线程结束时一次性写入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOperation {
    pub batch_id: String,
    pub operation_type: BatchOperationType,
    pub status: BatchStatus,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub items: Vec<BatchItemResult>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl BatchOperation {
    /// 按下标排序后汇总计数
    pub fn from_items(
        batch_id: String,
        operation_type: BatchOperationType,
        submitted_at: DateTime<Utc>,
        mut items: Vec<BatchItemResult>,
    ) -> Self {
        items.sort_by_key(|item| item.index);
        let successful = items.iter().filter(|item| item.success).count();
        Self {
            batch_id,
            operation_type,
            status: BatchStatus::Completed,
            total: items.len(),
            successful,
            failed: items.len() - successful,
            items,
            submitted_at,
            completed_at: Utc::now(),
            error: None,
        }
    }

    pub fn aborted(
        batch_id: String,
        operation_type: BatchOperationType,
        submitted_at: DateTime<Utc>,
        total: usize,
        error: String,
    ) -> Self {
        Self {
            batch_id,
            operation_type,
            status: BatchStatus::Failed,
            total,
            successful: 0,
            failed: total,
            items: Vec::new(),
            submitted_at,
            completed_at: Utc::now(),
            error: Some(error),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == BatchStatus::Completed
    }
}
