//! Message readers and the coordinator running them
//!
//! This module provides:
//! - [`WorkersCoordinator`] - self-sizing set of reader tasks with a rotating primary reader
//! - [`TransportMessageReader`] - receive, dispatch, commit/abort for one message at a time
//! - [`Bottleneck`] - bound on concurrent non-primary reads
//! - [`IncreasingBackoff`] - idle/error waits of the primary reader
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    WorkersCoordinator                        │
//! │   start budget (CAS)   primary slot (CAS)   live task map    │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐                      │
//! │  │ reader 1 │ │ reader 2 │ │ reader N │   one per task       │
//! │  │ primary  │ │          │ │          │                      │
//! │  └────┬─────┘ └────┬─────┘ └────┬─────┘                      │
//! │       │ exempt     └─────┬──────┘                            │
//! │       │                  ▼                                   │
//! │       │        ┌──────────────────┐                          │
//! │       │        │    Bottleneck    │  max_read_parallelism-1  │
//! │       │        └────────┬─────────┘                          │
//! │       ▼                 ▼                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │        Transport::receive ─► PipelineInvoker          │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use filebus::prelude::*;
//!
//! let options = BusOptions::new("/var/spool/bus")
//!     .with_input_queue("orders")
//!     .with_number_of_workers(4);
//!
//! let transport = Arc::new(FileSystemTransport::from_options(&options)?);
//! let pipeline = Arc::new(HandlerPipeline::new(|ctx| async move {
//!     tracing::info!(label = %ctx.message.label(), "Handled");
//!     Ok(())
//! }));
//!
//! let coordinator = WorkersCoordinatorFactory::new(options).create(transport, pipeline)?;
//!
//! // Graceful shutdown
//! coordinator.stop().await?;
//! ```

mod backoff;
mod bottleneck;
mod coordinator;
mod pipeline;
mod reader;

pub use backoff::{BackoffConfig, BackoffStrategy, IncreasingBackoff};
pub use bottleneck::{Bottleneck, BottleneckPermit};
pub use coordinator::{
    CoordinatorError, WorkersCoordinator, WorkersCoordinatorConfig, WorkersCoordinatorFactory,
};
pub use pipeline::{HandlerPipeline, IncomingContext, PipelineInvoker};
pub use reader::{
    MessageReader, MessageReaderFactory, ReaderCoordinator, ReaderError, ReaderResult,
    TransportMessageReader, TransportReaderFactory,
};
