//! Background queue: the manager facade over the persistent queue tables,
//! the dynamic worker pool, and the dead-letter handler.

pub mod dlq;
pub mod manager;
pub mod worker;

pub use dlq::{DlqHandler, DlqStats};
pub use manager::{spawn_queue_reaper, QueueManager};
pub use worker::{WorkerPool, WorkerPoolConfig};
