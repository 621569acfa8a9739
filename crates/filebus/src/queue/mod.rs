//! Durable file queue
//!
//! [`DurableFileQueue`] turns a queue directory into a FIFO dequeue
//! operation, amortizing directory scans through a per-process staging
//! cache. Exclusive ownership of a dequeued record comes from the store's
//! claim rename, never from the in-process locks.

mod file_queue;

pub use file_queue::{ClaimedRecord, DurableFileQueue, FileQueueConfig, QueueError, RefillMode};
