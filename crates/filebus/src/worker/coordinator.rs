//! Workers coordinator
//!
//! Owns a self-sizing set of reader tasks. The number of tasks is driven by
//! a start budget rather than a fixed pool:
//!
//! - `start()` sets the budget to `max_workers` and spawns one task
//! - a reader that finds work spawns another task (if the budget allows)
//! - an idle non-primary reader retires, giving its budget slot back
//! - lowering `max_workers` can push the budget below zero; each reader that
//!   retires then takes exactly one negative slot with it until the pool has
//!   shrunk
//!
//! Exactly one task at a time is usually the primary reader: it skips the
//! read throttle and is the only one that backs off when the queue is empty.
//! A vacant primary slot is taken by the next reader to start an iteration.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::IncreasingBackoff;
use super::bottleneck::{Bottleneck, BottleneckPermit};
use super::pipeline::PipelineInvoker;
use super::reader::{
    panic_message, MessageReaderFactory, ReaderCoordinator, ReaderError, TransportReaderFactory,
};
use crate::config::{
    duration_millis, BusOptions, ConfigError, DEFAULT_MAX_READ_PARALLELISM,
    DEFAULT_NUMBER_OF_WORKERS, DEFAULT_WORKER_SHUTDOWN_TIMEOUT,
};
use crate::transport::Transport;

/// Task ids wrap around here and restart at 1; 0 means "no task"
const MAX_TASK_ID: u64 = i64::MAX as u64;

const NO_PRIMARY: u64 = 0;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersCoordinatorConfig {
    /// Name used in logs
    pub name: String,

    /// Desired number of reader tasks
    pub max_workers: usize,

    /// Concurrent reads, primary reader included
    pub max_read_parallelism: usize,

    /// How long `stop` waits for tasks after the grace period
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Delay between cancelling and collecting tasks on `stop`
    #[serde(with = "duration_millis")]
    pub stop_grace: Duration,

    /// How long a paused reader waits per iteration
    #[serde(with = "duration_millis")]
    pub pause_interval: Duration,
}

impl Default for WorkersCoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "filebus".to_string(),
            max_workers: DEFAULT_NUMBER_OF_WORKERS,
            max_read_parallelism: DEFAULT_MAX_READ_PARALLELISM,
            shutdown_timeout: DEFAULT_WORKER_SHUTDOWN_TIMEOUT,
            stop_grace: Duration::from_secs(1),
            pause_interval: Duration::from_secs(1),
        }
    }
}

impl WorkersCoordinatorConfig {
    /// Create a configuration with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Take worker settings from bus options
    pub fn from_options(name: impl Into<String>, options: &BusOptions) -> Self {
        Self::new(name)
            .with_max_workers(options.number_of_workers)
            .with_max_read_parallelism(options.max_read_parallelism)
            .with_shutdown_timeout(options.worker_shutdown_timeout)
    }

    /// Set the desired number of workers
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Set maximum read parallelism
    pub fn with_max_read_parallelism(mut self, parallelism: usize) -> Self {
        self.max_read_parallelism = parallelism;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the stop grace period
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set the pause interval
    pub fn with_pause_interval(mut self, interval: Duration) -> Self {
        self.pause_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_read_parallelism < 1 {
            return Err(ConfigError::invalid_option(
                "max_read_parallelism",
                format!(
                    "{} is not a valid value, must be at least 1",
                    self.max_read_parallelism
                ),
            ));
        }
        Ok(())
    }
}

/// Coordinator errors
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Some tasks were still running when the shutdown timeout elapsed
    #[error("{remaining} reader task(s) did not stop within the shutdown timeout")]
    ShutdownTimeout { remaining: usize },

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Default)]
struct TaskSlot {
    handle: Option<JoinHandle<()>>,
    /// The task already gave its budget slot back when it retired
    budget_returned: bool,
}

struct CoordinatorInner {
    config: WorkersCoordinatorConfig,
    reader_factory: Arc<dyn MessageReaderFactory>,
    bottleneck: Bottleneck,
    max_workers: AtomicUsize,
    start_budget: AtomicI64,
    task_id_seq: AtomicU64,
    primary: AtomicU64,
    tasks: DashMap<u64, TaskSlot>,
    started: AtomicBool,
    paused: AtomicBool,
    cancel: Mutex<CancellationToken>,
    runtime: Mutex<Option<Handle>>,
    self_ref: Weak<CoordinatorInner>,
}

impl CoordinatorInner {
    /// Decrement the budget unless it is already exhausted
    fn try_decrement_budget(&self) -> bool {
        let mut current = self.start_budget.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.start_budget.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Give one budget slot back if the budget is negative
    fn try_increment_negative_budget(&self) -> bool {
        let mut current = self.start_budget.load(Ordering::Acquire);
        loop {
            if current >= 0 {
                return false;
            }
            match self.start_budget.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn next_task_id(&self) -> u64 {
        let mut current = self.task_id_seq.load(Ordering::Acquire);
        loop {
            let next = if current >= MAX_TASK_ID { 1 } else { current + 1 };
            match self.task_id_seq.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    fn try_start_new_task(&self) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        let cancel = self.cancel.lock().clone();
        if cancel.is_cancelled() {
            return false;
        }
        let Some(runtime) = self.runtime.lock().clone() else {
            return false;
        };
        if !self.try_decrement_budget() {
            return false;
        }
        let Some(inner) = self.self_ref.upgrade() else {
            self.start_budget.fetch_add(1, Ordering::AcqRel);
            return false;
        };

        let task_id = self.next_task_id();
        self.tasks.insert(task_id, TaskSlot::default());
        let handle = runtime.spawn(inner.run_task(task_id, cancel));
        // the task may already have exited and removed itself
        if let Some(mut slot) = self.tasks.get_mut(&task_id) {
            slot.handle = Some(handle);
        }

        debug!(coordinator = %self.config.name, task_id, "Started reader task");
        true
    }

    /// Tasks abandoned by a timed-out `stop` are no longer tracked
    fn is_live(&self, task_id: u64) -> bool {
        self.tasks.contains_key(&task_id)
    }

    /// Take the primary slot if nobody holds it
    fn claim_vacant_primary(&self, task_id: u64) {
        if self.is_live(task_id) {
            let _ = self.primary.compare_exchange(
                NO_PRIMARY,
                task_id,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn exit_task(&self, task_id: u64) {
        if let Some((_, slot)) = self.tasks.remove(&task_id) {
            if !slot.budget_returned {
                self.start_budget.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    async fn run_task(self: Arc<Self>, task_id: u64, cancel: CancellationToken) {
        let outcome = AssertUnwindSafe(Arc::clone(&self).reader_loop(task_id, cancel))
            .catch_unwind()
            .await;

        let _ = self.primary.compare_exchange(
            task_id,
            NO_PRIMARY,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.exit_task(task_id);

        match outcome {
            Ok(Ok(())) => debug!(coordinator = %self.config.name, task_id, "Reader task retired"),
            Ok(Err(ReaderError::Cancelled)) => {
                debug!(coordinator = %self.config.name, task_id, "Reader task cancelled")
            }
            Ok(Err(ReaderError::Fault(e))) => {
                error!(
                    coordinator = %self.config.name,
                    task_id,
                    error = ?e,
                    "Reader task failed, this should never happen"
                );
                self.try_start_new_task();
            }
            Err(panic) => {
                error!(
                    coordinator = %self.config.name,
                    task_id,
                    panic = %panic_message(panic.as_ref()),
                    "Reader task panicked, this should never happen"
                );
                self.try_start_new_task();
            }
        }
    }

    async fn reader_loop(
        self: Arc<Self>,
        task_id: u64,
        cancel: CancellationToken,
    ) -> Result<(), ReaderError> {
        if cancel.is_cancelled() {
            return Err(ReaderError::Cancelled);
        }

        let coordinator: Arc<dyn ReaderCoordinator> = self.clone();
        let reader = self.reader_factory.create_reader(task_id, coordinator);

        loop {
            // an idle reader takes over when the primary retired or is busy
            self.claim_vacant_primary(task_id);
            let result = reader.try_process_message(&cancel).await?;
            if result.removed || cancel.is_cancelled() {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl ReaderCoordinator for CoordinatorInner {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn pause_interval(&self) -> Duration {
        self.config.pause_interval
    }

    fn is_primary(&self, task_id: u64) -> bool {
        self.primary.load(Ordering::Acquire) == task_id
    }

    fn is_safe_to_remove(&self, task_id: u64, work_done: bool) -> bool {
        if !self.is_live(task_id) {
            return true;
        }
        // each surplus task takes exactly one negative budget slot with it
        if self.try_increment_negative_budget() {
            if let Some(mut slot) = self.tasks.get_mut(&task_id) {
                slot.budget_returned = true;
            }
            return true;
        }
        if work_done {
            return false;
        }
        self.claim_vacant_primary(task_id);
        !self.is_primary(task_id)
    }

    fn on_before_work(&self, task_id: u64) {
        let _ = self.primary.compare_exchange(
            task_id,
            NO_PRIMARY,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self.is_live(task_id) {
            self.try_start_new_task();
        }
    }

    fn on_after_work(&self, task_id: u64) {
        self.claim_vacant_primary(task_id);
    }

    async fn read_throttle(
        &self,
        is_primary: bool,
        cancel: &CancellationToken,
    ) -> Result<BottleneckPermit, ReaderError> {
        if is_primary {
            return Ok(BottleneckPermit::exempt());
        }
        self.bottleneck.enter(cancel).await
    }

    fn start_new_task(&self) -> bool {
        self.try_start_new_task()
    }
}

/// Self-sizing pool of reader tasks
///
/// # Example
///
/// ```ignore
/// let config = WorkersCoordinatorConfig::new("orders").with_max_workers(8);
/// let coordinator = WorkersCoordinator::new(config, reader_factory)?;
/// coordinator.start();
///
/// coordinator.set_max_workers(2);
///
/// coordinator.stop().await?;
/// ```
pub struct WorkersCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl WorkersCoordinator {
    /// Create a stopped coordinator
    pub fn new(
        config: WorkersCoordinatorConfig,
        reader_factory: Arc<dyn MessageReaderFactory>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let bottleneck = Bottleneck::new(config.max_read_parallelism);
        let max_workers = config.max_workers;

        let inner = Arc::new_cyclic(|self_ref| CoordinatorInner {
            config,
            reader_factory,
            bottleneck,
            max_workers: AtomicUsize::new(max_workers),
            start_budget: AtomicI64::new(0),
            task_id_seq: AtomicU64::new(0),
            primary: AtomicU64::new(NO_PRIMARY),
            tasks: DashMap::new(),
            started: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            runtime: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        Ok(Self { inner })
    }

    /// Coordinator name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Start reading; returns `true` once running
    ///
    /// Must be called from within a Tokio runtime. Calling it on a running
    /// coordinator does nothing.
    #[instrument(skip(self), fields(coordinator = %self.inner.config.name))]
    pub fn start(&self) -> bool {
        let inner = &self.inner;
        let Ok(runtime) = Handle::try_current() else {
            error!("Workers coordinator must be started from within a Tokio runtime");
            return false;
        };
        if inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return true;
        }

        *inner.runtime.lock() = Some(runtime);
        // task ids keep counting across restarts so readers abandoned by a
        // timed-out stop never collide with new ones
        *inner.cancel.lock() = CancellationToken::new();
        inner.primary.store(NO_PRIMARY, Ordering::Release);
        let max_workers = inner.max_workers.load(Ordering::Acquire);
        inner.start_budget.store(max_workers as i64, Ordering::Release);

        info!(
            max_workers,
            max_read_parallelism = inner.config.max_read_parallelism,
            "Starting workers coordinator"
        );
        inner.try_start_new_task();
        true
    }

    /// Stop all readers
    ///
    /// Cancels the readers, waits `stop_grace`, then waits up to
    /// `shutdown_timeout` for every task to exit. Tasks still running after
    /// that are abandoned, never aborted.
    #[instrument(skip(self), fields(coordinator = %self.inner.config.name))]
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        let inner = &self.inner;
        if inner
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        info!("Stopping workers coordinator");
        inner.cancel.lock().cancel();
        inner.paused.store(false, Ordering::Release);

        tokio::time::sleep(inner.config.stop_grace).await;

        let handles: Vec<JoinHandle<()>> = inner
            .tasks
            .iter_mut()
            .filter_map(|mut slot| slot.value_mut().handle.take())
            .collect();

        let result = if handles.is_empty() {
            Ok(())
        } else {
            match tokio::time::timeout(
                inner.config.shutdown_timeout,
                futures::future::join_all(handles),
            )
            .await
            {
                Ok(_) => Ok(()),
                Err(_) => {
                    let remaining = inner.tasks.len();
                    warn!(
                        remaining,
                        timeout_ms = inner.config.shutdown_timeout.as_millis() as u64,
                        "Workers coordinator did not shut down within the timeout"
                    );
                    Err(CoordinatorError::ShutdownTimeout { remaining })
                }
            }
        };

        inner.tasks.clear();
        inner.start_budget.store(0, Ordering::Release);
        inner.primary.store(NO_PRIMARY, Ordering::Release);
        info!("Workers coordinator stopped");
        result
    }

    /// Change the desired number of workers at runtime
    ///
    /// Shrinking only lowers the budget; surplus readers retire on their own.
    /// A pool that has drained to zero tasks gets one task started right away.
    pub fn set_max_workers(&self, count: usize) {
        let inner = &self.inner;
        let previous = inner.max_workers.swap(count, Ordering::AcqRel);
        let delta = count as i64 - previous as i64;
        let budget = inner.start_budget.fetch_add(delta, Ordering::AcqRel) + delta;
        debug!(
            coordinator = %inner.config.name,
            previous,
            count,
            budget,
            "Changed desired worker count"
        );

        if self.tasks_count() == 0 {
            inner.try_start_new_task();
        }
    }

    /// Desired number of workers
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers.load(Ordering::Acquire)
    }

    /// Number of live reader tasks
    pub fn tasks_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Remaining start budget (negative while shrinking)
    pub fn start_budget(&self) -> i64 {
        self.inner.start_budget.load(Ordering::Acquire)
    }

    /// Task currently holding the primary slot
    pub fn primary_task(&self) -> Option<u64> {
        match self.inner.primary.load(Ordering::Acquire) {
            NO_PRIMARY => None,
            id => Some(id),
        }
    }

    /// Whether the coordinator is running
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Stop touching the transport until [`WorkersCoordinator::resume`]
    pub fn pause(&self) {
        info!(coordinator = %self.inner.config.name, "Pausing readers");
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Resume reading
    pub fn resume(&self) {
        info!(coordinator = %self.inner.config.name, "Resuming readers");
        self.inner.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }
}

impl Drop for WorkersCoordinator {
    fn drop(&mut self) {
        let inner = &self.inner;
        if inner.started.swap(false, Ordering::AcqRel) {
            inner.cancel.lock().cancel();
            warn!(
                coordinator = %inner.config.name,
                tasks = inner.tasks.len(),
                "Workers coordinator dropped without stop, readers cancelled without waiting"
            );
        } else if !inner.tasks.is_empty() {
            warn!(
                coordinator = %inner.config.name,
                tasks = inner.tasks.len(),
                "Workers coordinator dropped with reader tasks still running"
            );
        }
    }
}

/// Wires a transport and a pipeline into a started coordinator
pub struct WorkersCoordinatorFactory {
    options: BusOptions,
}

impl WorkersCoordinatorFactory {
    pub fn new(options: BusOptions) -> Self {
        Self { options }
    }

    /// Build and start a coordinator reading from `transport`
    pub fn create(
        &self,
        transport: Arc<dyn Transport>,
        pipeline: Arc<dyn PipelineInvoker>,
    ) -> Result<WorkersCoordinator, CoordinatorError> {
        self.options.validate()?;
        let name = transport.address().map(str::to_string).ok_or_else(|| {
            ConfigError::invalid_option("input_queue", "a one-way client has no queue to read")
        })?;

        let backoff = Arc::new(IncreasingBackoff::new(self.options.backoff.clone()));
        let readers = Arc::new(TransportReaderFactory::new(transport, pipeline, backoff));
        let config = WorkersCoordinatorConfig::from_options(name, &self.options);

        let coordinator = WorkersCoordinator::new(config, readers)?;
        coordinator.start();
        Ok(coordinator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::reader::{MessageReader, ReaderResult};

    struct IdleReader {
        task_id: u64,
        coordinator: Arc<dyn ReaderCoordinator>,
    }

    #[async_trait]
    impl MessageReader for IdleReader {
        fn task_id(&self) -> u64 {
            self.task_id
        }

        fn coordinator(&self) -> &Arc<dyn ReaderCoordinator> {
            &self.coordinator
        }

        async fn do_work(
            &self,
            _is_primary: bool,
            cancel: &CancellationToken,
        ) -> Result<bool, ReaderError> {
            tokio::select! {
                _ = cancel.cancelled() => Err(ReaderError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(5)) => Ok(false),
            }
        }
    }

    struct IdleFactory;

    impl MessageReaderFactory for IdleFactory {
        fn create_reader(
            &self,
            task_id: u64,
            coordinator: Arc<dyn ReaderCoordinator>,
        ) -> Box<dyn MessageReader> {
            Box::new(IdleReader {
                task_id,
                coordinator,
            })
        }
    }

    fn config() -> WorkersCoordinatorConfig {
        WorkersCoordinatorConfig::new("test")
            .with_max_workers(3)
            .with_stop_grace(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    #[test]
    fn test_default_config() {
        let config = WorkersCoordinatorConfig::default();
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.max_read_parallelism, 4);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.stop_grace, Duration::from_secs(1));
        assert_eq!(config.pause_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_parallelism() {
        let result = WorkersCoordinator::new(
            config().with_max_read_parallelism(0),
            Arc::new(IdleFactory),
        );
        assert!(matches!(result, Err(CoordinatorError::Config(_))));
    }

    #[test]
    fn test_budget_never_decrements_below_zero() {
        let coordinator = WorkersCoordinator::new(config(), Arc::new(IdleFactory)).unwrap();
        coordinator.inner.start_budget.store(2, Ordering::SeqCst);
        assert!(coordinator.inner.try_decrement_budget());
        assert!(coordinator.inner.try_decrement_budget());
        assert!(!coordinator.inner.try_decrement_budget());
        assert_eq!(coordinator.start_budget(), 0);
    }

    #[test]
    fn test_task_ids_wrap() {
        let coordinator = WorkersCoordinator::new(config(), Arc::new(IdleFactory)).unwrap();
        coordinator
            .inner
            .task_id_seq
            .store(MAX_TASK_ID - 1, Ordering::SeqCst);
        assert_eq!(coordinator.inner.next_task_id(), MAX_TASK_ID);
        assert_eq!(coordinator.inner.next_task_id(), 1);
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let coordinator = WorkersCoordinator::new(config(), Arc::new(IdleFactory)).unwrap();
        assert!(!coordinator.start());
        assert!(!coordinator.is_started());
    }

    #[tokio::test]
    async fn test_idle_pool_keeps_only_primary() {
        let coordinator = WorkersCoordinator::new(config(), Arc::new(IdleFactory)).unwrap();
        assert!(coordinator.start());
        assert!(coordinator.start());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coordinator.tasks_count(), 1);
        assert!(coordinator.primary_task().is_some());

        coordinator.stop().await.unwrap();
        assert_eq!(coordinator.tasks_count(), 0);
        assert!(coordinator.primary_task().is_none());
    }

    #[tokio::test]
    async fn test_safe_to_remove_rules() {
        let coordinator = WorkersCoordinator::new(config(), Arc::new(IdleFactory)).unwrap();
        let inner = &coordinator.inner;
        inner.tasks.insert(7, TaskSlot::default());
        inner.tasks.insert(8, TaskSlot::default());
        inner.primary.store(7, Ordering::SeqCst);
        inner.start_budget.store(1, Ordering::SeqCst);

        assert!(!inner.is_safe_to_remove(7, false));
        assert!(inner.is_safe_to_remove(8, false));
        assert!(!inner.is_safe_to_remove(8, true));
        // not tracked any more
        assert!(inner.is_safe_to_remove(9, true));

        inner.start_budget.store(-1, Ordering::SeqCst);
        assert!(inner.is_safe_to_remove(7, true));
        assert_eq!(coordinator.start_budget(), 0);
    }

    #[tokio::test]
    async fn test_negative_budget_retires_one_task_per_slot() {
        let coordinator = WorkersCoordinator::new(config(), Arc::new(IdleFactory)).unwrap();
        let inner = &coordinator.inner;
        for id in 1..=3 {
            inner.tasks.insert(id, TaskSlot::default());
        }
        inner.start_budget.store(-1, Ordering::SeqCst);

        assert!(inner.is_safe_to_remove(1, true));
        assert!(!inner.is_safe_to_remove(2, true));
        assert!(!inner.is_safe_to_remove(3, true));

        // the retiring task already returned its slot
        inner.exit_task(1);
        assert_eq!(coordinator.start_budget(), 0);
        assert_eq!(coordinator.tasks_count(), 2);

        inner.exit_task(2);
        assert_eq!(coordinator.start_budget(), 1);
    }

    #[tokio::test]
    async fn test_primary_rotation() {
        let coordinator = WorkersCoordinator::new(config(), Arc::new(IdleFactory)).unwrap();
        let inner = &coordinator.inner;
        inner.tasks.insert(3, TaskSlot::default());
        inner.tasks.insert(5, TaskSlot::default());
        inner.primary.store(3, Ordering::SeqCst);

        inner.on_before_work(3);
        assert_eq!(coordinator.primary_task(), None);
        inner.on_after_work(5);
        assert_eq!(coordinator.primary_task(), Some(5));
        // only an empty slot can be taken
        inner.on_after_work(3);
        assert_eq!(coordinator.primary_task(), Some(5));
    }

    #[tokio::test]
    async fn test_untracked_task_cannot_take_primary() {
        let coordinator = WorkersCoordinator::new(config(), Arc::new(IdleFactory)).unwrap();
        let inner = &coordinator.inner;
        inner.tasks.insert(2, TaskSlot::default());

        inner.on_after_work(1);
        assert_eq!(coordinator.primary_task(), None);
        inner.claim_vacant_primary(2);
        assert_eq!(coordinator.primary_task(), Some(2));
    }

    #[tokio::test]
    async fn test_task_ids_continue_after_restart() {
        let coordinator = WorkersCoordinator::new(config(), Arc::new(IdleFactory)).unwrap();
        coordinator.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first = coordinator.primary_task().unwrap();
        coordinator.stop().await.unwrap();

        coordinator.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.primary_task().unwrap() > first);
        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let coordinator = WorkersCoordinator::new(config(), Arc::new(IdleFactory)).unwrap();
        coordinator.stop().await.unwrap();
        coordinator.start();
        coordinator.stop().await.unwrap();
        coordinator.stop().await.unwrap();
        assert!(!coordinator.is_started());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let coordinator = WorkersCoordinator::new(
            config().with_pause_interval(Duration::from_millis(5)),
            Arc::new(IdleFactory),
        )
        .unwrap();
        coordinator.start();
        coordinator.pause();
        assert!(coordinator.is_paused());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.tasks_count(), 1);

        coordinator.resume();
        assert!(!coordinator.is_paused());
        coordinator.stop().await.unwrap();
    }

    #[test]
    fn test_result_default_is_no_work() {
        assert_eq!(
            ReaderResult::default(),
            ReaderResult {
                work_done: false,
                removed: false
            }
        );
    }
}
