//! Transport layer
//!
//! This module provides:
//! - [`Transport`] - send/receive of [`TransportMessage`]s within a [`TransactionContext`]
//! - [`FileSystemTransport`] - the transport over per-queue directories
//! - [`MessageSerializer`] - how messages become record bytes

mod file_system;
mod message;
mod transaction;

pub use file_system::FileSystemTransport;
pub use message::{
    format_time_span, headers, parse_time_span, JsonMessageSerializer, MessageSerializer,
    TransportMessage,
};
pub use transaction::{TransactionContext, TransactionOutcome};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::store::StoreError;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Receive called on a one-way client
    #[error("this transport has no input queue and cannot receive")]
    NoInputQueue,

    /// Receive was cancelled
    #[error("receive cancelled")]
    Cancelled,

    /// The transaction already completed or aborted
    #[error("transaction already finished")]
    TransactionFinished,

    /// A header could not be parsed
    #[error("invalid value for header '{header}': '{value}'")]
    InvalidHeader { header: String, value: String },

    /// Record bytes are not a valid message
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl TransportError {
    /// Whether this error only reports cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<QueueError> for TransportError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Cancelled => Self::Cancelled,
            QueueError::Store(e) => Self::Store(e),
        }
    }
}

/// Message transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Input queue name; `None` for a one-way client
    fn address(&self) -> Option<&str>;

    /// Make sure a queue exists
    fn create_queue(&self, queue: &str) -> Result<(), TransportError>;

    /// Send a message to `destination`
    ///
    /// With a context the record is written when the context commits;
    /// without one it is written immediately.
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        context: Option<&TransactionContext>,
    ) -> Result<(), TransportError>;

    /// Receive the next message of the input queue, if any
    ///
    /// The received record is removed when `context` completes and moved to
    /// the error class when it aborts.
    async fn receive(
        &self,
        context: &TransactionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError>;
}
