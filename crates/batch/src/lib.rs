pub mod batch_pool;
pub mod executor;
pub mod storage;

pub use batch_pool::{BatchCallback, BatchStats, BatchWorkerPool};
pub use executor::Executor;
pub use storage::{ensure_container_path, find_or_create_container, StorageFactory};
