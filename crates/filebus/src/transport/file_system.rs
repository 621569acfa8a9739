//! File-system transport
//!
//! Sending writes a record into the destination queue directory (through
//! the claimed name, so no reader sees a half-written file); receiving
//! claims the next record of the input queue via [`DurableFileQueue`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::message::{JsonMessageSerializer, MessageSerializer, TransportMessage};
use super::transaction::TransactionContext;
use super::{Transport, TransportError};
use crate::config::{validate_queue_name, BusOptions};
use crate::queue::{ClaimedRecord, DurableFileQueue, FileQueueConfig};
use crate::store::{ClaimableStore, FileNameGenerator, FileRecordStore, Visibility};

/// Transport over one directory per queue
pub struct FileSystemTransport {
    store: Arc<dyn ClaimableStore>,
    input: Option<DurableFileQueue>,
    names: FileNameGenerator,
    serializer: Arc<dyn MessageSerializer>,
}

impl FileSystemTransport {
    /// Create a transport consuming `input_queue` (or a one-way client for `None`)
    ///
    /// The input queue name is validated and its directory created here, so
    /// misconfiguration surfaces before any reader starts.
    pub fn new(
        base_directory: impl AsRef<Path>,
        input_queue: Option<&str>,
        config: FileQueueConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let store: Arc<dyn ClaimableStore> = Arc::new(
            FileRecordStore::new(base_directory.as_ref()).with_claim_mode(config.claim_mode),
        );
        Self::with_store(store, input_queue, config)
    }

    /// Create a transport over an arbitrary store
    pub fn with_store(
        store: Arc<dyn ClaimableStore>,
        input_queue: Option<&str>,
        config: FileQueueConfig,
    ) -> Result<Self, TransportError> {
        let input = match input_queue {
            Some(queue) => {
                validate_queue_name(queue)?;
                store.ensure_queue(queue)?;
                info!(queue, "File-system transport consuming queue");
                Some(DurableFileQueue::new(queue, Arc::clone(&store), config))
            }
            None => {
                debug!("File-system transport running as one-way client");
                None
            }
        };

        Ok(Self {
            store,
            input,
            names: FileNameGenerator::new(),
            serializer: Arc::new(JsonMessageSerializer),
        })
    }

    /// Create a one-way client that can only send
    pub fn one_way(base_directory: impl AsRef<Path>) -> Result<Self, TransportError> {
        Self::new(base_directory, None, FileQueueConfig::default())
    }

    /// Create a transport from bus options
    pub fn from_options(options: &BusOptions) -> Result<Self, TransportError> {
        options.validate()?;
        Self::new(
            &options.base_directory,
            options.input_queue.as_deref(),
            options.queue.clone(),
        )
    }

    /// Replace the message serializer
    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Number of ready records waiting in `queue`
    pub async fn queue_depth(&self, queue: &str) -> Result<usize, TransportError> {
        let dir = self.store.ensure_queue(queue)?;
        Ok(self.store.count(&dir, Visibility::Ready).await?)
    }

    /// Discard a record we claimed but must not deliver
    async fn discard_poisoned(&self, record: &ClaimedRecord, error: &TransportError) {
        warn!(path = %record.path.display(), error = %error, "Moving unreadable record to error");
        if let Err(e) = self.store.release_to_error(&record.path).await {
            warn!(path = %record.path.display(), error = %e, "Could not move record to error");
        }
    }

    fn is_expired(record: &ClaimedRecord, message: &TransportMessage) -> Result<bool, TransportError> {
        let Some(ttl) = message.time_to_be_received()? else {
            return Ok(false);
        };
        Ok(record.name.age(Utc::now()) > ttl)
    }
}

#[async_trait]
impl Transport for FileSystemTransport {
    fn address(&self) -> Option<&str> {
        self.input.as_ref().map(DurableFileQueue::queue_name)
    }

    fn create_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.store.ensure_queue(queue)?;
        Ok(())
    }

    #[instrument(skip(self, message, context), fields(label = %message.label()))]
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        context: Option<&TransactionContext>,
    ) -> Result<(), TransportError> {
        let dir = self.store.ensure_queue(destination)?;
        let name = match message.deferred_until()? {
            Some(due) if due > Utc::now() => self.names.next_deferred(due),
            _ => self.names.next_ready(),
        };
        let bytes = self.serializer.serialize(&message)?;

        match context {
            Some(context) => {
                let store = Arc::clone(&self.store);
                context.on_committed(move || async move {
                    store
                        .publish(&dir, &name, &bytes)
                        .await
                        .map(|_| ())
                        .map_err(TransportError::from)
                });
            }
            None => {
                self.store.publish(&dir, &name, &bytes).await?;
            }
        }
        Ok(())
    }

    async fn receive(
        &self,
        context: &TransactionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError> {
        let queue = self.input.as_ref().ok_or(TransportError::NoInputQueue)?;

        loop {
            let Some(record) = queue.dequeue(cancel).await? else {
                return Ok(None);
            };

            let bytes = self.store.read(&record.path).await?;
            let message = match self
                .serializer
                .deserialize(&bytes)
                .and_then(|m| Self::is_expired(&record, &m).map(|expired| (m, expired)))
            {
                Ok((message, false)) => message,
                Ok((message, true)) => {
                    debug!(label = %message.label(), "Discarding expired message");
                    self.store.remove(&record.path).await?;
                    continue;
                }
                Err(e) => {
                    self.discard_poisoned(&record, &e).await;
                    return Err(e);
                }
            };

            // removal waits until every outgoing send is published
            let store = Arc::clone(&self.store);
            let path = record.path.clone();
            context.on_completed(move || async move {
                store.remove(&path).await.map_err(TransportError::from)
            });

            let store = Arc::clone(&self.store);
            let path = record.path;
            context.on_aborted(move || async move {
                store
                    .release_to_error(&path)
                    .await
                    .map(|_| ())
                    .map_err(TransportError::from)
            });

            return Ok(Some(message));
        }
    }
}
