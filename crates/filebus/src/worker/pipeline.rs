//! Message dispatch
//!
//! The reader hands every received message to a [`PipelineInvoker`]. An `Ok`
//! commits the transaction, an `Err` (or a panic) aborts it.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::transport::{TransactionContext, TransportMessage};

/// Everything a handler gets for one incoming message
#[derive(Clone)]
pub struct IncomingContext {
    /// The received message
    pub message: TransportMessage,

    /// Transaction the message was received in; sends registered here are
    /// written only if the handler succeeds
    pub transaction: Arc<TransactionContext>,

    /// Coordinator shutdown signal
    pub cancel: CancellationToken,
}

/// Dispatches an incoming message to application code
#[async_trait]
pub trait PipelineInvoker: Send + Sync {
    async fn invoke(&self, context: IncomingContext) -> anyhow::Result<()>;
}

type Handler = Arc<dyn Fn(IncomingContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// [`PipelineInvoker`] wrapping a single async handler
#[derive(Clone)]
pub struct HandlerPipeline {
    handler: Handler,
}

impl HandlerPipeline {
    /// Wrap an async closure
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(IncomingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |context| handler(context).boxed()),
        }
    }
}

#[async_trait]
impl PipelineInvoker for HandlerPipeline {
    async fn invoke(&self, context: IncomingContext) -> anyhow::Result<()> {
        (self.handler)(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(body: &str) -> IncomingContext {
        IncomingContext {
            message: TransportMessage::new(BTreeMap::new(), body.as_bytes().to_vec()),
            transaction: Arc::new(TransactionContext::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_handler_pipeline_invokes_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = {
            let calls = Arc::clone(&calls);
            HandlerPipeline::new(move |ctx| {
                let calls = Arc::clone(&calls);
                async move {
                    assert_eq!(ctx.message.body, b"ping");
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            })
        };

        pipeline.invoke(context("ping")).await.unwrap();
        pipeline.invoke(context("ping")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_error_is_returned() {
        let pipeline = HandlerPipeline::new(|_| async {
            Err::<(), _>(anyhow::anyhow!("no such customer"))
        });
        let err = pipeline.invoke(context("x")).await.unwrap_err();
        assert_eq!(err.to_string(), "no such customer");
    }
}
