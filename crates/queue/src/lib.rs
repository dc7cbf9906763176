pub mod handler;
pub mod handlers;
pub mod helpers;
pub mod queue;
mod retry;

pub use handler::{HandlerRegistry, TaskHandler};
pub use handlers::{register_builtin, MessagingPorts};
pub use helpers::to_payload;
pub use queue::{backoff_delay, QueueState, QueueStats, QueueStatus, TaskQueue};
