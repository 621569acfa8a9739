//! # filebus
//!
//! A message bus whose queues are plain directories on a (possibly shared)
//! file system.
//!
//! ## Features
//!
//! - **Broker-less queues**: one directory per queue, one JSON file per message
//! - **Exclusive claims**: an atomic rename decides which consumer owns a record,
//!   across threads and processes alike
//! - **Transactional send/receive**: outgoing messages are written and the
//!   incoming one removed only when the handler succeeds
//! - **Deferred delivery** and **time-to-be-received** expiry
//! - **Self-sizing readers**: a coordinator grows the reader set when work shows
//!   up and shrinks it when queues run dry
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    WorkersCoordinator                        │
//! │  (reader tasks, start budget, primary reader, shutdown)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   FileSystemTransport                        │
//! │  (envelopes, transactions, expiry, deferred send)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DurableFileQueue                          │
//! │  (staging cache, single-flight scans, deferred records)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     FileRecordStore                          │
//! │  (queue directories, claim-by-rename)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod queue;
pub mod store;
pub mod transport;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{BusOptions, ConfigError};
    pub use crate::queue::{DurableFileQueue, FileQueueConfig, QueueError, RefillMode};
    pub use crate::store::{ClaimMode, ClaimableStore, FileRecordStore, StoreError, Visibility};
    pub use crate::transport::{
        headers, FileSystemTransport, TransactionContext, TransactionOutcome, Transport,
        TransportError, TransportMessage,
    };
    pub use crate::worker::{
        BackoffConfig, CoordinatorError, HandlerPipeline, IncomingContext, PipelineInvoker,
        WorkersCoordinator, WorkersCoordinatorConfig, WorkersCoordinatorFactory,
    };
}

// Re-export key types at crate root
pub use config::{BusOptions, ConfigError};
pub use queue::{DurableFileQueue, FileQueueConfig, QueueError};
pub use store::{ClaimableStore, FileRecordStore, StoreError};
pub use transport::{FileSystemTransport, TransactionContext, Transport, TransportError, TransportMessage};
pub use worker::{
    CoordinatorError, HandlerPipeline, PipelineInvoker, WorkersCoordinator,
    WorkersCoordinatorConfig, WorkersCoordinatorFactory,
};
