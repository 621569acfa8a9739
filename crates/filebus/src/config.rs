//! Bus configuration
//!
//! [`BusOptions`] gathers everything needed to wire a file-system transport
//! and a workers coordinator. Values come from code (builders) or from the
//! environment via [`BusOptions::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::FileQueueConfig;
use crate::worker::BackoffConfig;

/// Default number of workers started by a coordinator
pub const DEFAULT_NUMBER_OF_WORKERS: usize = 1;

/// Default number of concurrent queue reads
pub const DEFAULT_MAX_READ_PARALLELISM: usize = 4;

/// Default time workers get to finish running handlers on shutdown
pub const DEFAULT_WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration errors; always raised at setup time, before any task starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Queue name contains characters that are not valid in a path segment
    #[error("cannot use '{name}' as a queue name because it contains the following invalid characters: {invalid}")]
    InvalidQueueName { name: String, invalid: String },

    /// Numeric or duration option out of range or unparsable
    #[error("invalid option {option}: {reason}")]
    InvalidOption { option: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid_option(option: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.to_string(),
            reason: reason.into(),
        }
    }
}

/// Check that a queue name can be used as a single directory name
pub fn validate_queue_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(ConfigError::InvalidQueueName {
            name: name.to_string(),
            invalid: "(reserved name)".to_string(),
        });
    }

    let mut invalid: Vec<char> = name
        .chars()
        .filter(|c| c.is_control() || matches!(c, '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*'))
        .collect();
    invalid.dedup();

    if invalid.is_empty() {
        return Ok(());
    }

    Err(ConfigError::InvalidQueueName {
        name: name.to_string(),
        invalid: invalid
            .iter()
            .map(|c| format!("'{}'", c.escape_default()))
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Options for a file-system bus endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusOptions {
    /// Directory under which each queue gets a subdirectory
    pub base_directory: PathBuf,

    /// Queue this endpoint consumes; `None` makes a one-way client
    pub input_queue: Option<String>,

    /// Desired number of concurrent readers
    pub number_of_workers: usize,

    /// Maximum concurrent queue reads (the primary reader is exempt)
    pub max_read_parallelism: usize,

    /// How long stop waits for readers to finish
    #[serde(with = "duration_millis")]
    pub worker_shutdown_timeout: Duration,

    /// Staging cache and scan settings
    pub queue: FileQueueConfig,

    /// Idle/error backoff of the primary reader
    pub backoff: BackoffConfig,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            base_directory: std::env::temp_dir().join("filebus"),
            input_queue: None,
            number_of_workers: DEFAULT_NUMBER_OF_WORKERS,
            max_read_parallelism: DEFAULT_MAX_READ_PARALLELISM,
            worker_shutdown_timeout: DEFAULT_WORKER_SHUTDOWN_TIMEOUT,
            queue: FileQueueConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl BusOptions {
    /// Create options for the given base directory
    pub fn new(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
            ..Default::default()
        }
    }

    /// Load options from environment variables
    ///
    /// - `FILEBUS_BASE_DIRECTORY`: base directory (default: `$TMPDIR/filebus`)
    /// - `FILEBUS_INPUT_QUEUE`: input queue (default: none, one-way client)
    /// - `FILEBUS_WORKERS`: number of workers (default: 1)
    /// - `FILEBUS_MAX_READ_PARALLELISM`: concurrent reads (default: 4)
    /// - `FILEBUS_SHUTDOWN_TIMEOUT_MS`: worker shutdown timeout (default: 60000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut options = Self::default();

        if let Ok(dir) = std::env::var("FILEBUS_BASE_DIRECTORY") {
            options.base_directory = PathBuf::from(dir);
        }
        if let Ok(queue) = std::env::var("FILEBUS_INPUT_QUEUE") {
            options.input_queue = Some(queue);
        }
        if let Some(workers) = env_number("FILEBUS_WORKERS")? {
            options.number_of_workers = workers as usize;
        }
        if let Some(parallelism) = env_number("FILEBUS_MAX_READ_PARALLELISM")? {
            options.max_read_parallelism = parallelism as usize;
        }
        if let Some(millis) = env_number("FILEBUS_SHUTDOWN_TIMEOUT_MS")? {
            options.worker_shutdown_timeout = Duration::from_millis(millis);
        }

        options.validate()?;
        Ok(options)
    }

    /// Set the input queue
    pub fn with_input_queue(mut self, queue: impl Into<String>) -> Self {
        self.input_queue = Some(queue.into());
        self
    }

    /// Set the number of workers
    pub fn with_number_of_workers(mut self, workers: usize) -> Self {
        self.number_of_workers = workers;
        self
    }

    /// Set maximum read parallelism
    pub fn with_max_read_parallelism(mut self, parallelism: usize) -> Self {
        self.max_read_parallelism = parallelism;
        self
    }

    /// Set the worker shutdown timeout
    pub fn with_worker_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.worker_shutdown_timeout = timeout;
        self
    }

    /// Set the file queue configuration
    pub fn with_queue(mut self, config: FileQueueConfig) -> Self {
        self.queue = config;
        self
    }

    /// Set the backoff configuration
    pub fn with_backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = config;
        self
    }

    /// Validate the options
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_read_parallelism < 1 {
            return Err(ConfigError::invalid_option(
                "max_read_parallelism",
                format!("{} is not a valid value, must be at least 1", self.max_read_parallelism),
            ));
        }
        if let Some(queue) = &self.input_queue {
            validate_queue_name(queue)?;
        }
        self.queue.validate()?;
        self.backoff.validate()?;
        Ok(())
    }
}

fn env_number(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::invalid_option(key, format!("'{}': {}", raw, e))),
        Err(_) => Ok(None),
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
