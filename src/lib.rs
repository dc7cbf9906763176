//! 门户后台任务执行与资源池化子系统
//!
//! [`WorkerRuntime`] 负责构建和关闭所有组件，并提供请求处理代码使用的边界接口。

pub mod app;
pub mod health;
pub mod runtime;
pub mod shutdown;
pub mod stubs;

pub use health::{HealthReport, HealthStatus};
pub use runtime::{Collaborators, DatastoreFactory, DatastoreHandle, WorkerRuntime};
