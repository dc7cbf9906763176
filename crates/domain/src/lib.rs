pub mod batch;
pub mod entities;
pub mod ports;

pub use batch::*;
pub use entities::*;
pub use ports::*;
pub use portal_errors::{ErrorKind, WorkerError, WorkerResult};
