//! Durable file queue with a local staging cache
//!
//! Directory scans are expensive, so each scan stages up to `cache_size`
//! candidate names in memory and later dequeues are served from there.
//! Scans themselves are single-flight and throttled: after a scan finds
//! nothing, the directory is not scanned again until `scan_backoff` has
//! passed. The filesystem is polled, never watched.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::config::{duration_millis, ConfigError};
use crate::store::{
    effective_order_key, now_ticks, ClaimMode, ClaimableStore, RecordName, StoreError, Visibility,
};

/// What a dequeue does when another task is already scanning the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefillMode {
    /// Wait for the scan to finish, then try the refreshed cache
    #[default]
    Wait,
    /// Return empty immediately instead of blocking on directory I/O
    Skip,
}

/// File queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileQueueConfig {
    /// Maximum names staged per scan
    pub cache_size: usize,

    /// Minimum time between scans after a scan found nothing
    #[serde(with = "duration_millis")]
    pub scan_backoff: Duration,

    /// Minimum time between scans for due deferred records
    #[serde(with = "duration_millis")]
    pub deferred_scan_backoff: Duration,

    /// Behaviour of concurrent refills
    pub refill_mode: RefillMode,

    /// How records are claimed
    pub claim_mode: ClaimMode,
}

impl Default for FileQueueConfig {
    fn default() -> Self {
        Self {
            cache_size: 1000,
            scan_backoff: Duration::from_millis(500),
            deferred_scan_backoff: Duration::from_secs(5),
            refill_mode: RefillMode::Wait,
            claim_mode: ClaimMode::Direct,
        }
    }
}

impl FileQueueConfig {
    /// Create a new file queue configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the staging cache size
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size.max(1);
        self
    }

    /// Set the scan backoff
    pub fn with_scan_backoff(mut self, backoff: Duration) -> Self {
        self.scan_backoff = backoff;
        self
    }

    /// Set the deferred scan backoff
    pub fn with_deferred_scan_backoff(mut self, backoff: Duration) -> Self {
        self.deferred_scan_backoff = backoff;
        self
    }

    /// Set the refill mode
    pub fn with_refill_mode(mut self, mode: RefillMode) -> Self {
        self.refill_mode = mode;
        self
    }

    /// Set the claim mode
    pub fn with_claim_mode(mut self, mode: ClaimMode) -> Self {
        self.claim_mode = mode;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_size == 0 {
            return Err(ConfigError::invalid_option(
                "cache_size",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// File queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Cancellation was requested while dequeuing
    #[error("dequeue cancelled")]
    Cancelled,

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A record this process now exclusively owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRecord {
    /// Path of the record under its claimed name
    pub path: PathBuf,
    /// Parsed name (claimed visibility)
    pub name: RecordName,
}

struct StagingCache {
    pending: VecDeque<String>,
    handled: HashSet<String>,
}

struct ScanState {
    last_no_message: Option<Instant>,
    last_deferred_scan: Option<Instant>,
}

/// Logical FIFO queue over one queue directory
pub struct DurableFileQueue {
    queue_name: String,
    store: Arc<dyn ClaimableStore>,
    config: FileQueueConfig,
    staging: Mutex<StagingCache>,
    refill: tokio::sync::Mutex<ScanState>,
}

impl DurableFileQueue {
    /// Create a queue over `queue_name` in `store`
    pub fn new(
        queue_name: impl Into<String>,
        store: Arc<dyn ClaimableStore>,
        config: FileQueueConfig,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            store,
            config,
            staging: Mutex::new(StagingCache {
                pending: VecDeque::new(),
                handled: HashSet::new(),
            }),
            refill: tokio::sync::Mutex::new(ScanState {
                last_no_message: None,
                last_deferred_scan: None,
            }),
        }
    }

    /// Name of the logical queue
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Number of names currently staged in memory
    pub fn staged_count(&self) -> usize {
        self.staging.lock().pending.len()
    }

    /// Pop the next staged name, if any
    ///
    /// The name leaves the cache here whether or not the claim that follows
    /// succeeds.
    pub fn try_dequeue_local(&self) -> Option<String> {
        let mut staging = self.staging.lock();
        let name = staging.pending.pop_front()?;
        staging.handled.remove(&name);
        Some(name)
    }

    /// Claim the next record, scanning the directory if the cache is empty
    ///
    /// Returns `Ok(None)` when nothing is available (or the scan is still
    /// throttled); losing a claim race is never an error.
    #[instrument(skip(self, cancel), fields(queue = %self.queue_name))]
    pub async fn dequeue(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ClaimedRecord>, QueueError> {
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let dir = self.store.ensure_queue(&self.queue_name)?;

        if let Some(record) = self.claim_next_local(&dir).await? {
            return Ok(Some(record));
        }

        let mut scan = match self.config.refill_mode {
            RefillMode::Wait => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                guard = self.refill.lock() => guard,
            },
            RefillMode::Skip => match self.refill.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Ok(None),
            },
        };

        // try again, another task may have refilled the cache meanwhile
        if let Some(record) = self.claim_next_local(&dir).await? {
            return Ok(Some(record));
        }

        if let Some(last) = scan.last_no_message {
            if last.elapsed() <= self.config.scan_backoff {
                return Ok(None);
            }
        }

        let added = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            added = self.refill_cache(&dir, &mut scan) => added?,
        };

        if added == 0 {
            scan.last_no_message = Some(Instant::now());
            return Ok(None);
        }

        self.claim_next_local(&dir).await
    }

    async fn claim_next_local(&self, dir: &Path) -> Result<Option<ClaimedRecord>, QueueError> {
        while let Some(file_name) = self.try_dequeue_local() {
            match self.store.try_claim(dir, &file_name).await? {
                Some(path) => {
                    let name = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .and_then(RecordName::parse)
                        .ok_or_else(|| StoreError::InvalidRecordName(path.display().to_string()))?;
                    return Ok(Some(ClaimedRecord { path, name }));
                }
                None => trace!(file = %file_name, "Lost claim race, trying next"),
            }
        }
        Ok(None)
    }

    /// Scan the directory and stage names not already staged
    async fn refill_cache(&self, dir: &Path, scan: &mut ScanState) -> Result<usize, QueueError> {
        let limit = self.config.cache_size;
        let mut found = self
            .store
            .list_candidates(dir, Visibility::Ready, limit)
            .await?;

        let deferred_due = scan
            .last_deferred_scan
            .map_or(true, |last| last.elapsed() > self.config.deferred_scan_backoff);
        if deferred_due {
            scan.last_deferred_scan = Some(Instant::now());
            let now = now_ticks();
            let due: Vec<String> = self
                .store
                .list_candidates(dir, Visibility::Deferred, limit)
                .await?
                .into_iter()
                .take_while(|name| RecordName::parse(name).is_some_and(|n| n.is_due(now)))
                .collect();

            if !due.is_empty() {
                debug!(count = due.len(), "Found due deferred records");
                found.extend(due);
                found.sort_by(|a, b| effective_order_key(a).cmp(effective_order_key(b)));
                found.truncate(limit);
            }
        }

        let mut staging = self.staging.lock();
        let mut added = 0;
        for name in found {
            if staging.handled.insert(name.clone()) {
                staging.pending.push_back(name);
                added += 1;
            }
        }

        trace!(added, "Refilled staging cache");
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ticks_from_datetime, FileNameGenerator, FileRecordStore};
    use chrono::Utc;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: Arc<FileRecordStore>,
        dir: PathBuf,
        generator: FileNameGenerator,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let store = Arc::new(FileRecordStore::new(tmp.path()));
            let dir = store.ensure_queue("input").unwrap();
            Self {
                _tmp: tmp,
                store,
                dir,
                generator: FileNameGenerator::new(),
            }
        }

        fn queue(&self, config: FileQueueConfig) -> DurableFileQueue {
            DurableFileQueue::new("input", self.store.clone(), config)
        }

        async fn publish(&self, name: RecordName) -> String {
            self.store.publish(&self.dir, &name, b"{}").await.unwrap();
            name.to_string()
        }

        async fn publish_ready(&self) -> String {
            self.publish(self.generator.next_ready()).await
        }
    }

    fn fast_config() -> FileQueueConfig {
        FileQueueConfig::default()
            .with_scan_backoff(Duration::from_millis(50))
            .with_deferred_scan_backoff(Duration::ZERO)
    }

    #[test]
    fn test_default_config() {
        let config = FileQueueConfig::default();
        assert_eq!(config.cache_size, 1000);
        assert_eq!(config.scan_backoff, Duration::from_millis(500));
        assert_eq!(config.deferred_scan_backoff, Duration::from_secs(5));
        assert_eq!(config.refill_mode, RefillMode::Wait);
        assert_eq!(config.claim_mode, ClaimMode::Direct);
    }

    #[test]
    fn test_config_builder() {
        let config = FileQueueConfig::new()
            .with_cache_size(0)
            .with_refill_mode(RefillMode::Skip)
            .with_claim_mode(ClaimMode::Unique);
        assert_eq!(config.cache_size, 1);
        assert_eq!(config.refill_mode, RefillMode::Skip);
        assert_eq!(config.claim_mode, ClaimMode::Unique);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_fifo_single_producer() {
        let fx = Fixture::new();
        let queue = fx.queue(fast_config());
        let cancel = CancellationToken::new();

        let sent = vec![
            fx.publish_ready().await,
            fx.publish_ready().await,
            fx.publish_ready().await,
        ];

        let mut received = Vec::new();
        while let Some(record) = queue.dequeue(&cancel).await.unwrap() {
            received.push(record.name.with_visibility(Visibility::Ready).to_string());
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_staging_cache_amortizes_scans() {
        let fx = Fixture::new();
        let queue = fx.queue(fast_config().with_cache_size(2));
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            fx.publish_ready().await;
        }

        assert!(queue.dequeue(&cancel).await.unwrap().is_some());
        assert_eq!(queue.staged_count(), 1);
        assert!(queue.dequeue(&cancel).await.unwrap().is_some());
        assert_eq!(queue.staged_count(), 0);
        assert!(queue.dequeue(&cancel).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_local_claim() {
        let fx = Fixture::new();
        let queue = Arc::new(fx.queue(fast_config()));
        let cancel = CancellationToken::new();

        const RECORDS: usize = 5;
        const CONSUMERS: usize = 20;
        for _ in 0..RECORDS {
            fx.publish_ready().await;
        }

        let mut handles = Vec::new();
        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { queue.dequeue(&cancel).await }));
        }

        let mut claimed = HashSet::new();
        let mut empty = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Some(record) => assert!(claimed.insert(record.path)),
                None => empty += 1,
            }
        }
        assert_eq!(claimed.len(), RECORDS);
        assert_eq!(empty, CONSUMERS - RECORDS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_queues_share_directory() {
        let fx = Fixture::new();
        // two instances stand in for two processes sharing the directory
        let first = Arc::new(fx.queue(fast_config()));
        let unique_store =
            Arc::new(FileRecordStore::new(fx._tmp.path()).with_claim_mode(ClaimMode::Unique));
        let second = Arc::new(DurableFileQueue::new("input", unique_store, fast_config()));
        let cancel = CancellationToken::new();

        for _ in 0..20 {
            fx.publish_ready().await;
        }

        let mut handles = Vec::new();
        for queue in [first, second] {
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(record) = queue.dequeue(&cancel).await.unwrap() {
                    mine.push(record.path);
                }
                mine
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for path in handle.await.unwrap() {
                assert!(all.insert(path));
            }
        }
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn test_empty_scan_is_throttled() {
        let fx = Fixture::new();
        let queue = fx.queue(fast_config().with_scan_backoff(Duration::from_millis(200)));
        let cancel = CancellationToken::new();

        assert!(queue.dequeue(&cancel).await.unwrap().is_none());

        fx.publish_ready().await;
        // still inside the backoff window, the directory is not rescanned
        assert!(queue.dequeue(&cancel).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(queue.dequeue(&cancel).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deferred_records_wait_until_due() {
        let fx = Fixture::new();
        let queue = fx.queue(fast_config());
        let cancel = CancellationToken::new();

        let later = Utc::now() + chrono::Duration::hours(1);
        fx.publish(fx.generator.next_deferred(later)).await;
        assert!(queue.dequeue(&cancel).await.unwrap().is_none());

        let earlier = Utc::now() - chrono::Duration::seconds(1);
        let due = fx.publish(fx.generator.next_deferred(earlier)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let record = queue.dequeue(&cancel).await.unwrap().unwrap();
        assert_eq!(
            record.name.with_visibility(Visibility::Deferred).to_string(),
            due
        );
        assert_eq!(
            fx.store.count(&fx.dir, Visibility::Deferred).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_due_deferred_ordered_by_timestamp() {
        let fx = Fixture::new();
        let queue = fx.queue(fast_config());
        let cancel = CancellationToken::new();

        let ready = fx.publish_ready().await;
        let ten_seconds_ago = Utc::now() - chrono::Duration::seconds(10);
        let deferred = fx.publish(fx.generator.next_deferred(ten_seconds_ago)).await;

        let first = queue.dequeue(&cancel).await.unwrap().unwrap();
        let second = queue.dequeue(&cancel).await.unwrap().unwrap();
        assert_eq!(effective_order_key(&deferred), first.name.sequence_key());
        assert_eq!(effective_order_key(&ready), second.name.sequence_key());
        assert!(first.name.ticks <= ticks_from_datetime(ten_seconds_ago));
    }

    #[tokio::test]
    async fn test_cancelled_dequeue() {
        let fx = Fixture::new();
        let queue = fx.queue(fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            queue.dequeue(&cancel).await,
            Err(QueueError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_vanished_staged_record_is_skipped() {
        let fx = Fixture::new();
        let queue = fx.queue(fast_config().with_cache_size(10));
        let cancel = CancellationToken::new();

        let first = fx.publish_ready().await;
        let second = fx.publish_ready().await;
        let third = fx.publish_ready().await;

        // stage all three, consuming the first
        queue.dequeue(&cancel).await.unwrap().unwrap();
        // another consumer steals the second behind our back
        fx.store.try_claim(&fx.dir, &second).await.unwrap().unwrap();

        let record = queue.dequeue(&cancel).await.unwrap().unwrap();
        assert_eq!(effective_order_key(&third), record.name.sequence_key());
        assert_ne!(effective_order_key(&first), record.name.sequence_key());
    }
}
