use portal_domain::{StorageClient, StorageConnector, WorkerResult};
use portal_pool::HandleFactory;
use std::sync::Arc;
use tracing::{debug, info};

/// 批处理客户端池使用的存储连接工厂
pub struct StorageFactory {
    connector: Arc<dyn StorageConnector>,
}

impl StorageFactory {
    pub fn new(connector: Arc<dyn StorageConnector>) -> Self {
        Self { connector }
    }
}

impl HandleFactory for StorageFactory {
    type Handle = Box<dyn StorageClient>;

    fn create(&self) -> WorkerResult<Box<dyn StorageClient>> {
        let client = self.connector.connect()?;
        debug!("已创建存储客户端");
        Ok(client)
    }

    fn is_healthy(&self, client: &mut Box<dyn StorageClient>) -> bool {
        client.ping().is_ok()
    }
}

/// 在 `parent_id` 下按名称查找容器，不存在时才创建
pub fn find_or_create_container(
    client: &mut dyn StorageClient,
    parent_id: &str,
    name: &str,
) -> WorkerResult<String> {
    if let Some(existing) = client.find_container(parent_id, name)? {
        debug!(parent_id, name, container_id = %existing, "容器已存在");
        return Ok(existing);
    }
    let created = client.create_container(parent_id, name)?;
    info!(parent_id, name, container_id = %created, "已创建容器");
    Ok(created)
}

/// 逐级解析路径，返回最后一级容器的ID
pub fn ensure_container_path(
    client: &mut dyn StorageClient,
    root_id: &str,
    segments: &[&str],
) -> WorkerResult<String> {
    let mut current = root_id.to_string();
    for segment in segments {
        current = find_or_create_container(client, &current, segment)?;
    }
    Ok(current)
}
