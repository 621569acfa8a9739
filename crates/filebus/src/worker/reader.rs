//! Per-task message reader
//!
//! Each coordinator task owns one reader and calls
//! [`MessageReader::try_process_message`] in a loop until the reader is
//! retired or the coordinator stops:
//!
//! ```text
//!            ┌──────────── paused ─────────────► wait, no work, stay
//!            │
//! read ──────┼── nothing ─┬─ primary ──────────► idle backoff, stay
//!            │            └─ other ────────────► retire
//!            │
//!            └── message ─► reset backoff
//!                           give up primary, start a task
//!                           dispatch ─► commit | abort
//!                           reclaim primary ───► stay
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::backoff::BackoffStrategy;
use super::bottleneck::BottleneckPermit;
use super::pipeline::{IncomingContext, PipelineInvoker};
use crate::transport::{TransactionContext, Transport, TransportMessage};

/// Outcome of one reader iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReaderResult {
    /// A message was dispatched
    pub work_done: bool,
    /// The reader should exit its loop
    pub removed: bool,
}

/// Reader errors
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// Cooperative shutdown; the task exits cleanly
    #[error("reader cancelled")]
    Cancelled,

    /// Anything else escaping a reader is a defect
    #[error("reader fault: {0}")]
    Fault(#[from] anyhow::Error),
}

/// The view of the coordinator a reader works against
#[async_trait]
pub trait ReaderCoordinator: Send + Sync {
    fn is_paused(&self) -> bool;

    fn pause_interval(&self) -> Duration;

    fn is_primary(&self, task_id: u64) -> bool;

    /// Whether the reader may exit after an iteration
    ///
    /// A `true` answer is final: the caller must exit its loop.
    fn is_safe_to_remove(&self, task_id: u64, work_done: bool) -> bool;

    /// Called right before dispatch: gives up the primary slot and scales up
    fn on_before_work(&self, task_id: u64);

    /// Called after dispatch: tries to take the primary slot back
    fn on_after_work(&self, task_id: u64);

    /// Wait for read capacity; the primary reader is exempt
    async fn read_throttle(
        &self,
        is_primary: bool,
        cancel: &CancellationToken,
    ) -> Result<BottleneckPermit, ReaderError>;

    /// Start one more task if the budget allows
    fn start_new_task(&self) -> bool;
}

/// A reader owned by one coordinator task
#[async_trait]
pub trait MessageReader: Send + Sync {
    fn task_id(&self) -> u64;

    fn coordinator(&self) -> &Arc<dyn ReaderCoordinator>;

    /// Read and dispatch at most one message; returns whether one was dispatched
    async fn do_work(&self, is_primary: bool, cancel: &CancellationToken) -> Result<bool, ReaderError>;

    /// One loop iteration, including pause handling and the retirement test
    async fn try_process_message(&self, cancel: &CancellationToken) -> Result<ReaderResult, ReaderError> {
        let coordinator = self.coordinator();

        if coordinator.is_paused() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ReaderError::Cancelled),
                _ = tokio::time::sleep(coordinator.pause_interval()) => {}
            }
            return Ok(ReaderResult {
                work_done: false,
                removed: false,
            });
        }

        if cancel.is_cancelled() {
            return Err(ReaderError::Cancelled);
        }

        let is_primary = coordinator.is_primary(self.task_id());
        let work_done = self.do_work(is_primary, cancel).await?;
        let removed =
            cancel.is_cancelled() || coordinator.is_safe_to_remove(self.task_id(), work_done);

        Ok(ReaderResult { work_done, removed })
    }
}

/// Creates the reader for a newly spawned task
pub trait MessageReaderFactory: Send + Sync {
    fn create_reader(
        &self,
        task_id: u64,
        coordinator: Arc<dyn ReaderCoordinator>,
    ) -> Box<dyn MessageReader>;
}

/// Reader receiving from a [`Transport`] and dispatching to a [`PipelineInvoker`]
pub struct TransportMessageReader {
    task_id: u64,
    coordinator: Arc<dyn ReaderCoordinator>,
    transport: Arc<dyn Transport>,
    pipeline: Arc<dyn PipelineInvoker>,
    backoff: Arc<dyn BackoffStrategy>,
}

impl TransportMessageReader {
    pub fn new(
        task_id: u64,
        coordinator: Arc<dyn ReaderCoordinator>,
        transport: Arc<dyn Transport>,
        pipeline: Arc<dyn PipelineInvoker>,
        backoff: Arc<dyn BackoffStrategy>,
    ) -> Self {
        Self {
            task_id,
            coordinator,
            transport,
            pipeline,
            backoff,
        }
    }

    /// Receive one message, absorbing every failure except cancellation
    async fn read_message(
        &self,
        is_primary: bool,
        context: &TransactionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, ReaderError> {
        let permit = self.coordinator.read_throttle(is_primary, cancel).await?;
        let received = self.transport.receive(context, cancel).await;
        drop(permit);

        match received {
            Ok(message) => Ok(message),
            Err(e) if e.is_cancelled() => Err(ReaderError::Cancelled),
            Err(e) => {
                warn!(
                    task_id = self.task_id,
                    error = %e,
                    "An error occurred when attempting to receive the next message"
                );
                if is_primary && self.backoff.wait_error(cancel).await {
                    return Err(ReaderError::Cancelled);
                }
                Ok(None)
            }
        }
    }

    /// Dispatch and finish the transaction; never fails
    async fn process_message(
        &self,
        context: Arc<TransactionContext>,
        message: TransportMessage,
        cancel: &CancellationToken,
    ) {
        let label = message.label();
        let incoming = IncomingContext {
            message,
            transaction: Arc::clone(&context),
            cancel: cancel.clone(),
        };

        let outcome = AssertUnwindSafe(self.pipeline.invoke(incoming))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = context.complete().await {
                    error!(
                        task_id = self.task_id,
                        label = %label,
                        error = %e,
                        "An error occurred when attempting to complete the transaction context"
                    );
                }
            }
            Ok(Err(e)) => {
                self.abort(&context).await;
                if cancel.is_cancelled() {
                    error!(task_id = self.task_id, label = %label, error = ?e, "Worker was aborted while handling message");
                } else {
                    error!(task_id = self.task_id, label = %label, error = ?e, "Unhandled error while handling message");
                }
            }
            Err(panic) => {
                self.abort(&context).await;
                error!(
                    task_id = self.task_id,
                    label = %label,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked while handling message"
                );
            }
        }
    }

    async fn abort(&self, context: &TransactionContext) {
        if let Err(e) = context.abort().await {
            warn!(task_id = self.task_id, error = %e, "Could not abort transaction context");
        }
    }
}

#[async_trait]
impl MessageReader for TransportMessageReader {
    fn task_id(&self) -> u64 {
        self.task_id
    }

    fn coordinator(&self) -> &Arc<dyn ReaderCoordinator> {
        &self.coordinator
    }

    async fn do_work(&self, is_primary: bool, cancel: &CancellationToken) -> Result<bool, ReaderError> {
        let context = Arc::new(TransactionContext::new());

        let Some(message) = self.read_message(is_primary, &context, cancel).await? else {
            if is_primary && self.backoff.wait_no_message(cancel).await {
                return Err(ReaderError::Cancelled);
            }
            return Ok(false);
        };

        // a claimed message is always dispatched, even when shutdown started meanwhile
        self.backoff.reset();
        self.coordinator.on_before_work(self.task_id);
        debug!(task_id = self.task_id, label = %message.label(), "Dispatching message");
        self.process_message(context, message, cancel).await;
        self.coordinator.on_after_work(self.task_id);

        Ok(true)
    }
}

/// Builds [`TransportMessageReader`]s sharing one transport, pipeline and backoff
pub struct TransportReaderFactory {
    transport: Arc<dyn Transport>,
    pipeline: Arc<dyn PipelineInvoker>,
    backoff: Arc<dyn BackoffStrategy>,
}

impl TransportReaderFactory {
    pub fn new(
        transport: Arc<dyn Transport>,
        pipeline: Arc<dyn PipelineInvoker>,
        backoff: Arc<dyn BackoffStrategy>,
    ) -> Self {
        Self {
            transport,
            pipeline,
            backoff,
        }
    }
}

impl MessageReaderFactory for TransportReaderFactory {
    fn create_reader(
        &self,
        task_id: u64,
        coordinator: Arc<dyn ReaderCoordinator>,
    ) -> Box<dyn MessageReader> {
        Box::new(TransportMessageReader::new(
            task_id,
            coordinator,
            Arc::clone(&self.transport),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.backoff),
        ))
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
