//! Content-addressed blob store for archived replays
//!
//! Verified bytes are stored under a path derived from their SHA-256:
//!
//! ```text
//! <root>/<h[0..2]>/<h[2..4]>/<h[4..]>.<extension>
//! ```
//!
//! Identical replays published under different IDs share one file. Writes go to
//! `<root>/.tmp/` first, are fsynced, then renamed into place, so a committed
//! path never holds partial bytes.

use crate::error::StorageError;
use crate::types::ReplayId;
use crate::verify::{Digest, sha256_hex};
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Result alias for blob store operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Staging directory name under the store root
const TEMP_DIR: &str = ".tmp";
/// Suffix of staging files
const PART_SUFFIX: &str = "part";

/// Where a payload ended up after [`BlobStore::store`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageRef {
    /// Content hash the blob is addressed by
    pub sha256: String,
    /// Final path of the blob
    pub path: PathBuf,
    /// Whether identical bytes were already present (nothing was written)
    pub deduplicated: bool,
}

/// Result of re-hashing a stored blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobCheck {
    /// No file at the content-addressed path
    Missing,
    /// File exists and its bytes hash to the expected value
    Intact,
    /// File exists but its bytes hash to something else
    Corrupt {
        /// Hash of the bytes actually on disk
        actual: String,
    },
}

/// Filesystem-backed, content-addressed replay store
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
    extension: String,
}

impl BlobStore {
    /// Open the store at `root`, creating it and its staging directory
    pub async fn new(root: impl AsRef<Path>, extension: impl Into<String>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let temp = root.join(TEMP_DIR);
        fs::create_dir_all(&temp)
            .await
            .map_err(|e| StorageError::io(&temp, e))?;

        Ok(Self {
            root,
            extension: extension.into(),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File extension appended to blob names
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Content-addressed path for `sha256`
    pub fn path_for(&self, sha256: &str) -> StorageResult<PathBuf> {
        if !Digest::is_valid_hex(sha256) {
            return Err(StorageError::InvalidHash(sha256.to_string()));
        }

        Ok(self
            .root
            .join(&sha256[0..2])
            .join(&sha256[2..4])
            .join(format!("{}.{}", &sha256[4..], self.extension)))
    }

    /// Whether a blob file exists for `sha256` (no re-hash)
    pub async fn contains(&self, sha256: &str) -> StorageResult<bool> {
        let path = self.path_for(sha256)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))
    }

    /// Read the bytes stored for `sha256`
    pub async fn read(&self, sha256: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(sha256)?;
        fs::read(&path).await.map_err(|e| StorageError::io(&path, e))
    }

    /// Re-hash the blob stored for `sha256`
    pub async fn check(&self, sha256: &str) -> StorageResult<BlobCheck> {
        let path = self.path_for(sha256)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BlobCheck::Missing),
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        let actual = sha256_hex(&bytes);
        if actual == sha256 {
            Ok(BlobCheck::Intact)
        } else {
            Ok(BlobCheck::Corrupt { actual })
        }
    }

    /// Persist verified `bytes` for replay `id`
    ///
    /// An intact blob with the same hash is reused without writing. A blob whose
    /// bytes no longer match its address is replaced atomically.
    pub async fn store(
        &self,
        id: ReplayId,
        bytes: &[u8],
        digest: &Digest,
    ) -> StorageResult<StorageRef> {
        let path = self.path_for(&digest.sha256)?;

        match self.check(&digest.sha256).await? {
            BlobCheck::Intact => {
                tracing::debug!(
                    replay_id = id.0,
                    sha256 = %digest.sha256,
                    "Blob already present, reusing"
                );
                return Ok(StorageRef {
                    sha256: digest.sha256.clone(),
                    path,
                    deduplicated: true,
                });
            }
            BlobCheck::Corrupt { actual } => {
                tracing::warn!(
                    replay_id = id.0,
                    expected = %digest.sha256,
                    actual = %actual,
                    path = %path.display(),
                    "Stored blob does not match its hash, replacing"
                );
            }
            BlobCheck::Missing => {}
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        let temp_path = self.temp_path(id);
        if let Err(e) = write_synced(&temp_path, bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io(&path, e));
        }

        if let Some(parent) = path.parent() {
            sync_dir(parent).await?;
        }

        tracing::debug!(
            replay_id = id.0,
            sha256 = %digest.sha256,
            size = digest.size_bytes,
            path = %path.display(),
            "Stored blob"
        );

        Ok(StorageRef {
            sha256: digest.sha256.clone(),
            path,
            deduplicated: false,
        })
    }

    /// Remove staging files left behind by an interrupted process
    ///
    /// Returns the number of files removed. Must not run concurrently with
    /// [`BlobStore::store`].
    pub async fn sweep_temp(&self) -> StorageResult<usize> {
        let temp_dir = self.root.join(TEMP_DIR);
        let mut entries = match fs::read_dir(&temp_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::io(&temp_dir, e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&temp_dir, e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StorageError::io(&path, e))?;
            if !file_type.is_file() {
                continue;
            }

            fs::remove_file(&path)
                .await
                .map_err(|e| StorageError::io(&path, e))?;
            removed += 1;
        }

        if removed > 0 {
            tracing::info!(removed, "Swept leftover staging files");
        }

        Ok(removed)
    }

    /// Number of committed blob files (staging files excluded)
    pub async fn count_blobs(&self) -> StorageResult<u64> {
        let suffix = format!(".{}", self.extension);
        let mut count = 0;
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| StorageError::io(&dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::io(&dir, e))?
            {
                let path = entry.path();
                // file_type() does not follow symlinks
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::io(&path, e))?;

                if file_type.is_dir() {
                    if entry.file_name() != TEMP_DIR {
                        stack.push(path);
                    }
                } else if file_type.is_file() && entry.file_name().to_string_lossy().ends_with(&suffix)
                {
                    count += 1;
                }
            }
        }

        Ok(count)
    }

    /// Copy the blob for `sha256` to `destination`
    ///
    /// Refuses to overwrite an existing file. Parent directories of the destination
    /// are created as needed.
    pub async fn export(&self, sha256: &str, destination: &Path) -> StorageResult<PathBuf> {
        let bytes = self.read(sha256).await?;

        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(destination)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StorageError::DestinationExists(destination.to_path_buf()));
            }
            Err(e) => return Err(StorageError::io(destination, e)),
        };

        file.write_all(&bytes)
            .await
            .map_err(|e| StorageError::io(destination, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(destination, e))?;

        tracing::info!(
            sha256 = %sha256,
            destination = %destination.display(),
            "Exported replay"
        );

        Ok(destination.to_path_buf())
    }

    /// File name of the blob for `sha256` (used when exporting into a directory)
    pub fn file_name_for(&self, sha256: &str) -> StorageResult<String> {
        let path = self.path_for(sha256)?;
        Ok(path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default())
    }

    fn temp_path(&self, id: ReplayId) -> PathBuf {
        let nonce: u64 = rand::thread_rng().r#gen();
        self.root
            .join(TEMP_DIR)
            .join(format!("{}-{:016x}.{}", id, nonce, PART_SUFFIX))
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    // Flush to disk before the rename publishes the file
    file.sync_all()
        .await
        .map_err(|e| StorageError::io(path, e))?;
    Ok(())
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> StorageResult<()> {
    let handle = fs::File::open(dir)
        .await
        .map_err(|e| StorageError::io(dir, e))?;
    handle
        .sync_all()
        .await
        .map_err(|e| StorageError::io(dir, e))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}
