pub mod app_config;
pub mod cache;
pub mod pool;
pub mod task_queue;

pub use app_config::*;
pub use cache::*;
pub use pool::*;
pub use task_queue::*;
