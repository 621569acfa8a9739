//! Transaction context
//!
//! A [`TransactionContext`] is the unit of work around one received message.
//! Sends and the removal of the received record are registered as callbacks
//! and only hit the disk when the context completes:
//!
//! ```text
//! receive ──► handler ──┬── Ok  ──► complete(): on_committed*, on_completed*
//!                       │              └─ commit fails ──► on_aborted*
//!                       └── Err ──► abort():    on_aborted*
//! ```

use std::collections::HashMap;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::TransportError;

type Callback = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TransportError>> + Send>;

/// How a transaction finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Completed,
    Aborted,
}

#[derive(Default)]
struct CallbackState {
    committed: Vec<Callback>,
    completed: Vec<Callback>,
    aborted: Vec<Callback>,
    outcome: Option<TransactionOutcome>,
}

/// Scope of work around a received message
pub struct TransactionContext {
    id: Uuid,
    items: Mutex<HashMap<String, serde_json::Value>>,
    state: Mutex<CallbackState>,
}

impl TransactionContext {
    /// Create an unfinished transaction
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            items: Mutex::new(HashMap::new()),
            state: Mutex::new(CallbackState::default()),
        }
    }

    /// Transaction id, for logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Outcome, once finished
    pub fn outcome(&self) -> Option<TransactionOutcome> {
        self.state.lock().outcome
    }

    /// Run `callback` when the transaction commits
    pub fn on_committed<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        self.state
            .lock()
            .committed
            .push(Box::new(move || callback().boxed()));
    }

    /// Run `callback` after all commit callbacks succeeded
    pub fn on_completed<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        self.state
            .lock()
            .completed
            .push(Box::new(move || callback().boxed()));
    }

    /// Run `callback` when the transaction is aborted
    pub fn on_aborted<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        self.state
            .lock()
            .aborted
            .push(Box::new(move || callback().boxed()));
    }

    /// Store an item for the lifetime of the transaction
    pub fn set_item(&self, key: impl Into<String>, value: serde_json::Value) {
        self.items.lock().insert(key.into(), value);
    }

    /// Get a stored item
    pub fn item(&self, key: &str) -> Option<serde_json::Value> {
        self.items.lock().get(key).cloned()
    }

    /// Commit: run commit callbacks, then completion callbacks, in registration order
    ///
    /// The first failing commit callback rolls the transaction back: the abort
    /// callbacks run and the commit error is returned. Completion callbacks
    /// only run once every commit callback succeeded.
    pub async fn complete(&self) -> Result<(), TransportError> {
        let (committed, completed, aborted) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return Err(TransportError::TransactionFinished);
            }
            state.outcome = Some(TransactionOutcome::Completed);
            (
                std::mem::take(&mut state.committed),
                std::mem::take(&mut state.completed),
                std::mem::take(&mut state.aborted),
            )
        };

        debug!(transaction = %self.id, callbacks = committed.len() + completed.len(), "Completing transaction");
        for callback in committed {
            if let Err(e) = callback().await {
                warn!(transaction = %self.id, error = %e, "Commit callback failed, rolling back");
                self.state.lock().outcome = Some(TransactionOutcome::Aborted);
                self.run_aborted(aborted).await;
                return Err(e);
            }
        }
        for callback in completed {
            callback().await?;
        }
        Ok(())
    }

    /// Roll back: run abort callbacks; their failures are logged, not returned
    pub async fn abort(&self) -> Result<(), TransportError> {
        let aborted = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return Err(TransportError::TransactionFinished);
            }
            state.outcome = Some(TransactionOutcome::Aborted);
            state.committed.clear();
            state.completed.clear();
            std::mem::take(&mut state.aborted)
        };

        debug!(transaction = %self.id, callbacks = aborted.len(), "Aborting transaction");
        self.run_aborted(aborted).await;
        Ok(())
    }

    async fn run_aborted(&self, aborted: Vec<Callback>) {
        for callback in aborted {
            if let Err(e) = callback().await {
                warn!(transaction = %self.id, error = %e, "Abort callback failed");
            }
        }
    }
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let pending = state.committed.len() + state.aborted.len();
        if state.outcome.is_none() && pending > 0 {
            warn!(transaction = %self.id, pending, "Transaction dropped unfinished, callbacks discarded");
        }
    }
}
