//! Read throttling
//!
//! Bounds how many non-primary readers may be inside `Transport::receive` at
//! the same time. The primary reader never waits here, so the semaphore holds
//! one permit less than the configured read parallelism.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::reader::ReaderError;

/// Counting gate for concurrent reads
#[derive(Debug)]
pub struct Bottleneck {
    semaphore: Arc<Semaphore>,
    permits: usize,
}

impl Bottleneck {
    /// Create a gate for `max_read_parallelism` concurrent reads, primary included
    pub fn new(max_read_parallelism: usize) -> Self {
        let permits = max_read_parallelism.saturating_sub(1).max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits,
        }
    }

    /// Total permits
    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Permits not currently held
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a permit, or fail with [`ReaderError::Cancelled`]
    pub async fn enter(&self, cancel: &CancellationToken) -> Result<BottleneckPermit, ReaderError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReaderError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit
                .map(BottleneckPermit::held)
                .map_err(|_| ReaderError::Cancelled),
        }
    }

    /// Wait at most `timeout` for a permit
    ///
    /// On timeout the returned permit reports `acquired() == false` and
    /// releases nothing when dropped.
    pub async fn try_enter(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<BottleneckPermit, ReaderError> {
        match tokio::time::timeout(timeout, self.enter(cancel)).await {
            Ok(permit) => permit,
            Err(_) => Ok(BottleneckPermit {
                permit: None,
                acquired: false,
            }),
        }
    }
}

/// Handle returned by [`Bottleneck::enter`]; the permit goes back on drop
#[derive(Debug)]
#[must_use = "the permit is released as soon as it is dropped"]
pub struct BottleneckPermit {
    permit: Option<OwnedSemaphorePermit>,
    acquired: bool,
}

impl BottleneckPermit {
    fn held(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Some(permit),
            acquired: true,
        }
    }

    /// A permit for the primary reader, which is not throttled
    pub fn exempt() -> Self {
        Self {
            permit: None,
            acquired: true,
        }
    }

    /// Whether the caller may proceed
    pub fn acquired(&self) -> bool {
        self.acquired
    }

    /// Whether this permit holds a semaphore slot
    pub fn is_exempt(&self) -> bool {
        self.acquired && self.permit.is_none()
    }

    /// Give the permit back now
    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_is_subtracted() {
        assert_eq!(Bottleneck::new(4).permits(), 3);
        assert_eq!(Bottleneck::new(2).permits(), 1);
        assert_eq!(Bottleneck::new(1).permits(), 1);
        assert_eq!(Bottleneck::new(0).permits(), 1);
    }

    #[tokio::test]
    async fn test_enter_and_release() {
        let bottleneck = Bottleneck::new(3);
        let cancel = CancellationToken::new();

        let first = bottleneck.enter(&cancel).await.unwrap();
        let second = bottleneck.enter(&cancel).await.unwrap();
        assert_eq!(bottleneck.available(), 0);

        drop(first);
        assert_eq!(bottleneck.available(), 1);
        second.release();
        assert_eq!(bottleneck.available(), 2);
    }

    #[tokio::test]
    async fn test_try_enter_times_out() {
        let bottleneck = Bottleneck::new(2);
        let cancel = CancellationToken::new();
        let _held = bottleneck.enter(&cancel).await.unwrap();

        let permit = bottleneck
            .try_enter(&cancel, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!permit.acquired());
        drop(permit);
        // a failed attempt releases nothing
        assert_eq!(bottleneck.available(), 0);
    }

    #[tokio::test]
    async fn test_enter_observes_cancellation() {
        let bottleneck = Arc::new(Bottleneck::new(2));
        let cancel = CancellationToken::new();
        let _held = bottleneck.enter(&cancel).await.unwrap();

        let waiter = {
            let bottleneck = Arc::clone(&bottleneck);
            let cancel = cancel.clone();
            tokio::spawn(async move { bottleneck.enter(&cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(ReaderError::Cancelled)));
    }

    #[tokio::test]
    async fn test_permit_released_on_panic() {
        let bottleneck = Arc::new(Bottleneck::new(2));
        let task = {
            let bottleneck = Arc::clone(&bottleneck);
            tokio::spawn(async move {
                let _permit = bottleneck.enter(&CancellationToken::new()).await.unwrap();
                panic!("boom");
            })
        };
        assert!(task.await.is_err());
        assert_eq!(bottleneck.available(), 1);
    }

    #[test]
    fn test_exempt_permit() {
        let permit = BottleneckPermit::exempt();
        assert!(permit.acquired());
        assert!(permit.is_exempt());
    }
}
