//! Directory-backed record store
//!
//! Every queue is a directory; every record is a file whose name carries
//! its visibility class. Moving a record between classes is a rename, and a
//! successful rename into the claimed class is the only thing that makes a
//! consumer the exclusive owner of a record.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::record::{RecordName, Visibility, RECORD_EXTENSION};
use crate::config::{validate_queue_name, ConfigError};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Queue directory could not be created and does not exist
    #[error("could not initialize directory '{}' for queue named '{queue}': {source}", .path.display())]
    Initialization {
        queue: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Invalid queue name
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// File name is not a record name
    #[error("not a record file: {0}")]
    InvalidRecordName(String),

    /// Any other I/O failure
    #[error("i/o error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// How a ready record is moved into the claimed class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimMode {
    /// Rename straight to the claimed name
    #[default]
    Direct,
    /// Rename to a globally unique scratch name first, then to the claimed name
    Unique,
}

/// Storage capability the file queue and transport are built on
///
/// The contract of [`ClaimableStore::try_claim`] is the whole correctness
/// story: at most one caller, in any process, gets `Some` for a given record.
#[async_trait]
pub trait ClaimableStore: Send + Sync {
    /// Make sure the queue exists and return its location (memoized)
    fn ensure_queue(&self, queue: &str) -> Result<PathBuf, StoreError>;

    /// Names of records of the given visibility, ascending, at most `limit`
    async fn list_candidates(
        &self,
        queue_dir: &Path,
        visibility: Visibility,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Count records of the given visibility
    async fn count(&self, queue_dir: &Path, visibility: Visibility) -> Result<usize, StoreError>;

    /// Claim a record; `None` means another consumer got there first
    async fn try_claim(
        &self,
        queue_dir: &Path,
        file_name: &str,
    ) -> Result<Option<PathBuf>, StoreError>;

    /// Move a claimed record to the error class
    async fn release_to_error(&self, claimed: &Path) -> Result<Option<PathBuf>, StoreError>;

    /// Write a record under its claimed name, then rename it into visibility
    async fn publish(
        &self,
        queue_dir: &Path,
        name: &RecordName,
        bytes: &[u8],
    ) -> Result<PathBuf, StoreError>;

    /// Read a record's content
    async fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError>;

    /// Delete a record; a record that is already gone is not an error
    async fn remove(&self, path: &Path) -> Result<(), StoreError>;
}

/// [`ClaimableStore`] over ordinary directories
pub struct FileRecordStore {
    base_directory: PathBuf,
    claim_mode: ClaimMode,
    initialized: DashMap<String, PathBuf>,
    init_lock: Mutex<()>,
}

impl FileRecordStore {
    /// Create a store rooted at `base_directory`
    pub fn new(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
            claim_mode: ClaimMode::default(),
            initialized: DashMap::new(),
            init_lock: Mutex::new(()),
        }
    }

    /// Set the claim mode
    pub fn with_claim_mode(mut self, mode: ClaimMode) -> Self {
        self.claim_mode = mode;
        self
    }

    /// Base directory of all queues
    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    /// Directory a queue maps to (without creating it)
    pub fn directory_for_queue(&self, queue: &str) -> PathBuf {
        self.base_directory.join(queue)
    }

    fn renamed_path(path: &Path, visibility: Visibility) -> Result<PathBuf, StoreError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::InvalidRecordName(path.display().to_string()))?;
        let name = RecordName::parse(file_name)
            .ok_or_else(|| StoreError::InvalidRecordName(file_name.to_string()))?;
        Ok(path.with_file_name(name.with_visibility(visibility).to_string()))
    }

    /// Rename, mapping a vanished source to `None`
    async fn rename_if_present(from: &Path, to: &Path) -> Result<Option<PathBuf>, StoreError> {
        match tokio::fs::rename(from, to).await {
            Ok(()) => Ok(Some(to.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(path = %from.display(), "Record already gone");
                Ok(None)
            }
            Err(e) => Err(StoreError::io(from, e)),
        }
    }
}

#[async_trait]
impl ClaimableStore for FileRecordStore {
    fn ensure_queue(&self, queue: &str) -> Result<PathBuf, StoreError> {
        if let Some(dir) = self.initialized.get(queue) {
            return Ok(dir.clone());
        }

        validate_queue_name(queue)?;

        let _guard = self.init_lock.lock();
        // double check, another caller may have finished while we waited
        if let Some(dir) = self.initialized.get(queue) {
            return Ok(dir.clone());
        }

        let dir = self.directory_for_queue(queue);
        if !dir.is_dir() {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                // a concurrent creator (maybe another process) winning is fine
                if !dir.is_dir() {
                    return Err(StoreError::Initialization {
                        queue: queue.to_string(),
                        path: dir,
                        source: e,
                    });
                }
            } else {
                debug!(queue, path = %dir.display(), "Created queue directory");
            }
        }

        self.initialized.insert(queue.to_string(), dir.clone());
        Ok(dir)
    }

    async fn list_candidates(
        &self,
        queue_dir: &Path,
        visibility: Visibility,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let prefix = visibility.prefix();
        let mut entries = tokio::fs::read_dir(queue_dir)
            .await
            .map_err(|e| StoreError::io(queue_dir, e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(queue_dir, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) && name.ends_with(RECORD_EXTENSION) {
                    names.push(name.to_string());
                }
            }
        }

        names.sort_unstable();
        names.truncate(limit);
        Ok(names)
    }

    async fn count(&self, queue_dir: &Path, visibility: Visibility) -> Result<usize, StoreError> {
        Ok(self
            .list_candidates(queue_dir, visibility, usize::MAX)
            .await?
            .len())
    }

    async fn try_claim(
        &self,
        queue_dir: &Path,
        file_name: &str,
    ) -> Result<Option<PathBuf>, StoreError> {
        let source = queue_dir.join(file_name);
        let claimed = Self::renamed_path(&source, Visibility::Claimed)?;

        match self.claim_mode {
            ClaimMode::Direct => Self::rename_if_present(&source, &claimed).await,
            ClaimMode::Unique => {
                let scratch = queue_dir.join(format!("u{}.claim", Uuid::now_v7().simple()));
                let Some(scratch) = Self::rename_if_present(&source, &scratch).await? else {
                    return Ok(None);
                };
                match tokio::fs::rename(&scratch, &claimed).await {
                    Ok(()) => Ok(Some(claimed)),
                    Err(e) => {
                        // put the record back so it stays claimable
                        if let Err(restore) = tokio::fs::rename(&scratch, &source).await {
                            warn!(
                                scratch = %scratch.display(),
                                record = %file_name,
                                error = %restore,
                                "Could not restore record after a failed claim"
                            );
                        }
                        Err(StoreError::io(&scratch, e))
                    }
                }
            }
        }
    }

    async fn release_to_error(&self, claimed: &Path) -> Result<Option<PathBuf>, StoreError> {
        let target = Self::renamed_path(claimed, Visibility::Error)?;
        Self::rename_if_present(claimed, &target).await
    }

    async fn publish(
        &self,
        queue_dir: &Path,
        name: &RecordName,
        bytes: &[u8],
    ) -> Result<PathBuf, StoreError> {
        use tokio::io::AsyncWriteExt;

        let staged = queue_dir.join(name.with_visibility(Visibility::Claimed).to_string());
        let target = queue_dir.join(name.to_string());

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged)
            .await
            .map_err(|e| StoreError::io(&staged, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(&staged, e))?;
        file.flush().await.map_err(|e| StoreError::io(&staged, e))?;
        drop(file);

        tokio::fs::rename(&staged, &target)
            .await
            .map_err(|e| StoreError::io(&staged, e))?;
        Ok(target)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn remove(&self, path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}
