//! Download and materialization of stored objects

use crate::archive::{self, RestoredArtifact};
use crate::config::{RetryConfig, TransferConfig};
use crate::key::StorageKey;
use crate::retry::retry_with_backoff;
use crate::store::ObjectStore;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, instrument};

/// Fetches objects and restores them at local destinations
#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn ObjectStore>,
    retry: RetryConfig,
    temp_dir: PathBuf,
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("store", &self.store.provider_name())
            .field("temp_dir", &self.temp_dir)
            .finish_non_exhaustive()
    }
}

impl Retriever {
    /// Create a retriever over `store`
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, config: &TransferConfig) -> Self {
        Self {
            store,
            retry: config.retry.clone(),
            temp_dir: config.effective_temp_dir(),
        }
    }

    /// Download the object under `storage_key` and restore it at `destination`
    ///
    /// The downloaded bytes are decompressed and sniffed; the sniffed format
    /// decides whether a file is written or an archive unpacked. A missing
    /// object is `Error::NotFound`; every other failure is
    /// `Error::Retrieval`.
    pub async fn fetch(
        &self,
        bucket: &str,
        storage_key: &StorageKey,
        destination: &Path,
    ) -> Result<RestoredArtifact> {
        let staged = self.stage(bucket, storage_key, destination).await?;
        tokio::task::spawn_blocking(move || staged.commit())
            .await
            .map_err(|e| {
                Error::retrieval(storage_key.as_str(), format!("restore task failed: {e}"))
            })?
    }

    /// Download and unpack the object under `storage_key` without touching
    /// `destination`
    ///
    /// The result sits in a private directory next to the destination until
    /// [`StagedRestore::commit`] moves it into place. Dropping it instead
    /// removes everything that was staged.
    #[instrument(
        name = "stage",
        skip(self, storage_key, destination),
        fields(storage_key = %storage_key, destination = %destination.display())
    )]
    pub async fn stage(
        &self,
        bucket: &str,
        storage_key: &StorageKey,
        destination: &Path,
    ) -> Result<StagedRestore> {
        let key = storage_key.as_str();

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| Error::retrieval(key, format!("creating temporary directory: {e}")))?;
        let download = tempfile::Builder::new()
            .prefix("cistash-")
            .suffix(".zst")
            .tempfile_in(&self.temp_dir)
            .map_err(|e| Error::retrieval(key, format!("creating download file: {e}")))?
            .into_temp_path();

        let size = retry_with_backoff(&self.retry, "get_object", || {
            self.store.get_object(bucket, key, &download)
        })
        .await
        .map_err(|e| {
            if e.is_not_found() {
                Error::NotFound {
                    storage_key: key.to_string(),
                }
            } else {
                Error::retrieval(key, format!("download failed: {e}"))
            }
        })?;
        debug!(storage_key = %storage_key, size, "Downloaded object");

        let dest = destination.to_path_buf();
        tokio::task::spawn_blocking(move || StagedRestore::unpack(&download, dest))
            .await
            .map_err(|e| Error::retrieval(key, format!("restore task failed: {e}")))?
            .map_err(|e| Error::retrieval(key, e.to_string()))
    }
}

/// A restored artifact waiting to be moved to its destination
#[derive(Debug)]
pub struct StagedRestore {
    staging: TempDir,
    artifact: RestoredArtifact,
    destination: PathBuf,
}

impl StagedRestore {
    /// Decompress and unpack into a staging directory beside `destination`
    fn unpack(download: &Path, destination: PathBuf) -> Result<Self> {
        let parent = archive::restore_parent(&destination)?;
        std::fs::create_dir_all(&parent).map_err(|e| Error::io(e, &parent, "create_dir_all"))?;

        // Same filesystem as the destination so committing is a rename
        let staging = tempfile::Builder::new()
            .prefix(".cistash-")
            .tempdir_in(&parent)
            .map_err(|e| Error::io(e, &parent, "create staging directory"))?;
        let absolute = std::path::absolute(&destination)
            .map_err(|e| Error::io(e, &destination, "resolve"))?;
        let name = absolute.file_name().ok_or_else(|| {
            Error::validation(format!(
                "Cannot restore {}: the path has no file name",
                destination.display()
            ))
        })?;
        let staged = staging.path().join(name);

        let mut decompressed = tempfile::Builder::new()
            .prefix(".cistash-")
            .tempfile_in(staging.path())
            .map_err(|e| Error::io(e, staging.path(), "create staging file"))?;
        archive::decompress(download, decompressed.as_file_mut())?;
        let artifact = archive::unpack(decompressed, &staged)?;

        if std::fs::symlink_metadata(artifact.path()).is_err() {
            return Err(Error::format(format!(
                "archive for {} does not contain {}",
                destination.display(),
                name.to_string_lossy()
            )));
        }

        Ok(Self {
            staging,
            artifact,
            destination,
        })
    }

    /// Where the artifact will be restored
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Move the staged artifact to its destination
    ///
    /// Blocking; async callers use `spawn_blocking`.
    pub fn commit(self) -> Result<RestoredArtifact> {
        archive::move_into_place(self.artifact.path(), &self.destination)?;
        drop(self.staging);
        Ok(match self.artifact {
            RestoredArtifact::File(_) => RestoredArtifact::File(self.destination),
            RestoredArtifact::Directory(_) => RestoredArtifact::Directory(self.destination),
        })
    }
}
