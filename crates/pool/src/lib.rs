pub mod guard;
pub mod pool;

pub use guard::PooledHandle;
pub use pool::{HandleFactory, PoolStats, ResourcePool};
