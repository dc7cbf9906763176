use portal_domain::{Task, TaskType, WorkerError, WorkerResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// 任务处理器，只包含业务逻辑
///
/// 处理器在工作线程上同步执行；返回的错误会进入队列的重试流程。
#[cfg_attr(test, mockall::automock)]
pub trait TaskHandler: Send + Sync {
    fn handle(&self, task: &Task) -> WorkerResult<Value>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Task) -> WorkerResult<Value> + Send + Sync,
{
    fn handle(&self, task: &Task) -> WorkerResult<Value> {
        self(task)
    }
}

/// 按任务类型注册的处理器表
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，同一类型重复注册时覆盖旧的
    pub fn register<H>(&mut self, task_type: TaskType, handler: H) -> &mut Self
    where
        H: TaskHandler + 'static,
    {
        self.handlers.insert(task_type, Arc::new(handler));
        self
    }

    /// 注册闭包处理器
    pub fn register_fn<F>(&mut self, task_type: TaskType, handler: F) -> &mut Self
    where
        F: Fn(&Task) -> WorkerResult<Value> + Send + Sync + 'static,
    {
        self.register(task_type, handler)
    }

    pub fn register_arc(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(task_type, handler);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, task: &Task) -> WorkerResult<Value> {
        match self.handlers.get(&task.task_type) {
            Some(handler) => handler.handle(task),
            None => Err(WorkerError::HandlerNotFound {
                task_type: task.task_type.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
