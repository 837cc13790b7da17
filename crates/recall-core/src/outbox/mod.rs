//! Outbox: durable at-least-once buffer for turns that missed the store.

pub mod log;
pub mod queue;
pub mod retry;

pub use log::{fold_records, OutboxLog};
pub use queue::{Delivery, OutboxQueue, ReplayReport};
pub use retry::RetryPolicy;
