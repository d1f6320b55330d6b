//! Storage for binary result payloads.
//!
//! Jobs never hold audio bytes. The broker writes them to a [`BlobStore`] and
//! keeps only the returned handle.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// Suffixed names tried before a write gives up on finding a free handle.
const MAX_HANDLE_ATTEMPTS: u32 = 64;

/// Persistence for binary payloads, keyed by an opaque handle.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `bytes` for `job_id` and return the handle to retrieve them.
    ///
    /// Every call gets a handle of its own; an existing payload is never
    /// overwritten.
    async fn write(&self, job_id: &Uuid, extension: &str, bytes: Bytes) -> Result<String>;

    /// Read back a payload by handle.
    async fn read(&self, handle: &str) -> Result<Bytes>;

    /// Remove a payload. Deleting an unknown handle is not an error.
    async fn delete(&self, handle: &str) -> Result<()>;
}

/// File name used for a binary result, e.g. `audio_20241210_181932_<id>.mp3`.
pub fn blob_file_name(job_id: &Uuid, extension: &str) -> String {
    numbered_name(&timestamp(), job_id, extension, 0)
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Attempt zero is the plain name; later attempts append `_<n>` before the extension.
fn numbered_name(stamp: &str, job_id: &Uuid, extension: &str, attempt: u32) -> String {
    if attempt == 0 {
        format!("audio_{}_{}.{}", stamp, job_id, extension)
    } else {
        format!("audio_{}_{}_{}.{}", stamp, job_id, attempt, extension)
    }
}

fn candidate_names<'a>(job_id: &'a Uuid, extension: &'a str) -> impl Iterator<Item = String> + 'a {
    let stamp = timestamp();
    (0..MAX_HANDLE_ATTEMPTS).map(move |attempt| numbered_name(&stamp, job_id, extension, attempt))
}

fn handles_exhausted(job_id: &Uuid) -> Error {
    Error::StorageFailure(format!("No free blob handle for job {}", job_id))
}

fn validate_handle(handle: &str) -> Result<()> {
    if handle.is_empty()
        || handle.contains('/')
        || handle.contains('\\')
        || handle.contains("..")
    {
        return Err(Error::Malformed(format!("Invalid blob handle: {:?}", handle)));
    }
    Ok(())
}

fn storage_error(context: &str, e: std::io::Error) -> Error {
    Error::StorageFailure(format!("{}: {}", context, e))
}

/// Writes each payload to its own file inside a directory.
#[derive(Debug, Clone)]
pub struct DiskBlobStore {
    dir: PathBuf,
}

impl DiskBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn write(&self, job_id: &Uuid, extension: &str, bytes: Bytes) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| storage_error("Failed to create blob directory", e))?;

        for handle in candidate_names(job_id, extension) {
            let path = self.dir.join(&handle);
            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(storage_error("Failed to create blob", e)),
            };

            let written = match file.write_all(&bytes).await {
                Ok(()) => file.sync_all().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                drop(file);
                if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to remove partial blob {}: {}", path.display(), cleanup);
                }
                return Err(storage_error("Failed to write blob", e));
            }

            info!("Saved {} byte result for job {} to {}", bytes.len(), job_id, path.display());
            return Ok(handle);
        }

        Err(handles_exhausted(job_id))
    }

    async fn read(&self, handle: &str) -> Result<Bytes> {
        validate_handle(handle)?;
        let path = self.dir.join(handle);

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::Malformed(format!("Unknown blob handle: {}", handle)))
            }
            Err(e) => Err(storage_error("Failed to read blob", e)),
        }
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        validate_handle(handle)?;
        match tokio::fs::remove_file(self.dir.join(handle)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("Failed to delete blob", e)),
        }
    }
}

/// Keeps payloads in memory. Used in tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Bytes>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn write(&self, job_id: &Uuid, extension: &str, bytes: Bytes) -> Result<String> {
        for handle in candidate_names(job_id, extension) {
            if let Entry::Vacant(slot) = self.blobs.entry(handle.clone()) {
                slot.insert(bytes);
                return Ok(handle);
            }
        }
        Err(handles_exhausted(job_id))
    }

    async fn read(&self, handle: &str) -> Result<Bytes> {
        validate_handle(handle)?;
        self.blobs
            .get(handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Malformed(format!("Unknown blob handle: {}", handle)))
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        validate_handle(handle)?;
        self.blobs.remove(handle);
        Ok(())
    }
}
