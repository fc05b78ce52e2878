//! Upload of compressed payloads to the object store
//!
//! Payloads up to `part_size` bytes are sent with one `put_object`. Larger
//! payloads go through an [`UploadSession`]: fixed-size chunks are uploaded
//! as parts numbered from 1 and then completed in ascending order. A session
//! that does not complete is aborted exactly once, including when the upload
//! is cancelled or its future is dropped.

use crate::archive::Payload;
use crate::config::{RetryConfig, TransferConfig};
use crate::key::StorageKey;
use crate::retry::retry_with_backoff;
use crate::store::{CompletedPart, ObjectStore};
use crate::{Error, Result};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Most parts a single multipart upload may have
pub const MAX_PARTS: u64 = 10_000;

/// How a payload was sent to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One `put_object` request
    SinglePut,
    /// A completed multipart upload with this many parts
    Multipart {
        /// Number of uploaded parts
        parts: usize,
    },
}

/// Uploads payloads under storage keys
#[derive(Clone)]
pub struct Transport {
    store: Arc<dyn ObjectStore>,
    part_size: u64,
    retry: RetryConfig,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("store", &self.store.provider_name())
            .field("part_size", &self.part_size)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Create a transport over `store`
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, config: &TransferConfig) -> Self {
        Self {
            store,
            part_size: config.effective_part_size(),
            retry: config.retry.clone(),
        }
    }

    /// Single-put threshold and chunk size
    #[must_use]
    pub const fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Upload `payload` so it becomes the object under `storage_key`
    #[instrument(
        name = "upload",
        skip(self, storage_key, payload, cancel),
        fields(storage_key = %storage_key, size = payload.size())
    )]
    pub async fn upload(
        &self,
        bucket: &str,
        storage_key: &StorageKey,
        payload: &Payload,
        cancel: &CancellationToken,
    ) -> Result<UploadStrategy> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if payload.size() <= self.part_size {
            self.put_single(bucket, storage_key, payload.path(), cancel)
                .await?;
            debug!(storage_key = %storage_key, "Uploaded payload in a single request");
            return Ok(UploadStrategy::SinglePut);
        }

        let mut session = UploadSession::begin(
            Arc::clone(&self.store),
            bucket,
            storage_key,
            self.retry.clone(),
        )
        .await?;

        let chunk_size = self.chunk_size(payload.size());
        match upload_parts(&mut session, payload.path(), chunk_size, cancel).await {
            Ok(()) => {
                let parts = session.parts().len();
                session.complete().await?;
                info!(storage_key = %storage_key, parts, "Completed multipart upload");
                Ok(UploadStrategy::Multipart { parts })
            }
            Err(err) => {
                session.abort().await;
                Err(err)
            }
        }
    }

    async fn put_single(
        &self,
        bucket: &str,
        storage_key: &StorageKey,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let body = Bytes::from(
            tokio::fs::read(path)
                .await
                .map_err(|e| Error::io(e, path, "read payload"))?,
        );
        let key = storage_key.as_str();
        let put = retry_with_backoff(&self.retry, "put_object", || {
            self.store.put_object(bucket, key, body.clone())
        });
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            res = put => res.map_err(|e| Error::transfer("put_object", key, e)),
        }
    }

    /// Chunk size for a payload, grown past `part_size` only when the part
    /// count would exceed [`MAX_PARTS`]
    fn chunk_size(&self, size: u64) -> u64 {
        self.part_size.max(size.div_ceil(MAX_PARTS))
    }
}

/// Read `path` in `chunk_size` pieces and upload each as the next part
async fn upload_parts(
    session: &mut UploadSession,
    path: &Path,
    chunk_size: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::io(e, path, "open payload"))?;

    loop {
        let mut chunk = Vec::with_capacity(usize::try_from(chunk_size).unwrap_or_default());
        (&mut file)
            .take(chunk_size)
            .read_to_end(&mut chunk)
            .await
            .map_err(|e| Error::io(e, path, "read payload"))?;
        if chunk.is_empty() {
            return Ok(());
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            res = session.upload_part(Bytes::from(chunk)) => res?,
        }
    }
}

/// An open multipart upload
///
/// Consumed by [`complete`](Self::complete) or [`abort`](Self::abort). A
/// session dropped while still open spawns its abort on the current Tokio
/// runtime.
pub struct UploadSession {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    storage_key: StorageKey,
    upload_id: String,
    parts: Vec<CompletedPart>,
    retry: RetryConfig,
    open: bool,
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("storage_key", &self.storage_key)
            .field("upload_id", &self.upload_id)
            .field("parts", &self.parts.len())
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl UploadSession {
    /// Start a multipart upload for `storage_key`
    pub async fn begin(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        storage_key: &StorageKey,
        retry: RetryConfig,
    ) -> Result<Self> {
        let key = storage_key.as_str();
        let upload_id = retry_with_backoff(&retry, "create_multipart_upload", || {
            store.create_multipart_upload(bucket, key)
        })
        .await
        .map_err(|e| Error::transfer("create_multipart_upload", key, e))?;

        debug!(storage_key = %storage_key, upload_id = %upload_id, "Started multipart upload");

        Ok(Self {
            store,
            bucket: bucket.to_string(),
            storage_key: storage_key.clone(),
            upload_id,
            parts: Vec::new(),
            retry,
            open: true,
        })
    }

    /// Backend identifier of this upload
    #[must_use]
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Parts uploaded so far, in ascending order
    #[must_use]
    pub fn parts(&self) -> &[CompletedPart] {
        &self.parts
    }

    /// Upload `body` as the next part
    pub async fn upload_part(&mut self, body: Bytes) -> Result<()> {
        let part_number = i32::try_from(self.parts.len() + 1)
            .map_err(|_| Error::validation("Too many parts for one multipart upload"))?;
        let key = self.storage_key.as_str();
        let size = body.len();

        let etag = retry_with_backoff(&self.retry, "upload_part", || {
            self.store.upload_part(
                &self.bucket,
                key,
                &self.upload_id,
                part_number,
                body.clone(),
            )
        })
        .await
        .map_err(|e| Error::transfer("upload_part", key, e))?;

        debug!(storage_key = %self.storage_key, part_number, size, "Uploaded part");
        self.parts.push(CompletedPart { part_number, etag });
        Ok(())
    }

    /// Assemble the uploaded parts into the final object
    ///
    /// On failure the upload is aborted before the error is returned.
    ///
    /// The session stays open until the store has answered, so dropping this
    /// future midway still aborts the upload.
    pub async fn complete(mut self) -> Result<()> {
        let result = retry_with_backoff(&self.retry, "complete_multipart_upload", || {
            self.store.complete_multipart_upload(
                &self.bucket,
                self.storage_key.as_str(),
                &self.upload_id,
                &self.parts,
            )
        })
        .await;

        match result {
            Ok(()) => {
                self.open = false;
                Ok(())
            }
            Err(e) => {
                let err = Error::transfer("complete_multipart_upload", self.storage_key.as_str(), e);
                self.send_abort().await;
                self.open = false;
                Err(err)
            }
        }
    }

    /// Discard the upload and every part stored so far
    ///
    /// An abort failure is logged; it never masks the error that caused it.
    pub async fn abort(mut self) {
        self.send_abort().await;
        self.open = false;
    }

    async fn send_abort(&self) {
        let key = self.storage_key.as_str();
        let result = retry_with_backoff(&self.retry, "abort_multipart_upload", || {
            self.store
                .abort_multipart_upload(&self.bucket, key, &self.upload_id)
        })
        .await;

        match result {
            Ok(()) => debug!(
                storage_key = %self.storage_key,
                upload_id = %self.upload_id,
                "Aborted multipart upload"
            ),
            Err(e) => warn!(
                storage_key = %self.storage_key,
                upload_id = %self.upload_id,
                error = %e,
                "Failed to abort multipart upload; stored parts may remain until lifecycle expiry"
            ),
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let store = Arc::clone(&self.store);
        let bucket = std::mem::take(&mut self.bucket);
        let key = self.storage_key.to_string();
        let upload_id = std::mem::take(&mut self.upload_id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.abort_multipart_upload(&bucket, &key, &upload_id).await {
                        warn!(
                            storage_key = %key,
                            upload_id = %upload_id,
                            error = %e,
                            "Failed to abort dropped multipart upload"
                        );
                    }
                });
            }
            Err(_) => warn!(
                storage_key = %key,
                upload_id = %upload_id,
                "Multipart upload dropped outside a runtime; it was not aborted"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive;
    use crate::key::CacheKey;
    use crate::memory::{MemoryStore, StoreCall};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(part_size: u64) -> TransferConfig {
        TransferConfig {
            part_size,
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                backoff_multiplier: 2.0,
            },
            ..TransferConfig::default()
        }
    }

    fn storage_key(path: &str) -> StorageKey {
        StorageKey::derive(None, &CacheKey::new("v1").unwrap(), &PathBuf::from(path))
    }

    /// Pack `raw_len` bytes of pseudo-random data, which zstd cannot shrink
    fn payload_of_size(temp: &TempDir, name: &str, raw_len: usize) -> Payload {
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let data: Vec<u8> = (0..raw_len)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                (state >> 33) as u8
            })
            .collect();
        let src = temp.path().join(name);
        std::fs::write(&src, data).unwrap();
        archive::pack(&src, temp.path(), 3).unwrap()
    }

    #[tokio::test]
    async fn test_small_payload_uses_single_put() {
        let temp = TempDir::new().unwrap();
        let payload = payload_of_size(&temp, "small.bin", 100);
        let store = Arc::new(MemoryStore::new());
        let transport = Transport::new(store.clone(), &config(1024 * 1024));
        let key = storage_key("small.bin");

        let strategy = transport
            .upload("b", &key, &payload, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(strategy, UploadStrategy::SinglePut);
        assert_eq!(
            store.object("b", key.as_str()).unwrap().as_ref(),
            std::fs::read(payload.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_large_payload_uses_numbered_parts() {
        let temp = TempDir::new().unwrap();
        let payload = payload_of_size(&temp, "big.bin", 4096);
        let part_size = payload.size() / 3;
        let store = Arc::new(MemoryStore::new());
        let transport = Transport::new(store.clone(), &config(part_size));
        let key = storage_key("big.bin");

        let strategy = transport
            .upload("b", &key, &payload, &CancellationToken::new())
            .await
            .unwrap();

        let expected = payload.size().div_ceil(part_size) as usize;
        assert_eq!(strategy, UploadStrategy::Multipart { parts: expected });

        let calls = store.calls();
        let numbers: Vec<i32> = calls
            .iter()
            .filter_map(|c| match c {
                StoreCall::UploadPart { part_number, .. } => Some(*part_number),
                _ => None,
            })
            .collect();
        assert_eq!(numbers, (1..=expected as i32).collect::<Vec<_>>());
        assert!(calls.iter().any(|c| matches!(
            c,
            StoreCall::CompleteMultipartUpload { part_numbers, .. } if *part_numbers == numbers
        )));
        assert_eq!(
            store.object("b", key.as_str()).unwrap().as_ref(),
            std::fs::read(payload.path()).unwrap()
        );
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_part_failure_aborts_once_and_stops() {
        let temp = TempDir::new().unwrap();
        let payload = payload_of_size(&temp, "big.bin", 4096);
        let part_size = payload.size() / 4;
        let store = Arc::new(MemoryStore::new());
        store.fail_part(2);
        let transport = Transport::new(store.clone(), &config(part_size));
        let key = storage_key("big.bin");

        let err = transport
            .upload("b", &key, &payload, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer { operation: "upload_part", .. }));

        let calls = store.calls();
        let aborts = calls
            .iter()
            .filter(|c| matches!(c, StoreCall::AbortMultipartUpload { .. }))
            .count();
        assert_eq!(aborts, 1);
        assert!(!calls.iter().any(|c| matches!(
            c,
            StoreCall::UploadPart { part_number: 3.., .. }
                | StoreCall::CompleteMultipartUpload { .. }
        )));
        assert!(store.object("b", key.as_str()).is_none());
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_complete_failure_aborts_once() {
        let temp = TempDir::new().unwrap();
        let payload = payload_of_size(&temp, "big.bin", 4096);
        let store = Arc::new(MemoryStore::new());
        store.fail_complete();
        let transport = Transport::new(store.clone(), &config(payload.size() / 2));
        let key = storage_key("big.bin");

        let err = transport
            .upload("b", &key, &payload, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer {
                operation: "complete_multipart_upload",
                ..
            }
        ));
        let aborts = store
            .calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::AbortMultipartUpload { .. }))
            .count();
        assert_eq!(aborts, 1);
    }

    #[tokio::test]
    async fn test_transient_part_failure_is_retried() {
        let temp = TempDir::new().unwrap();
        let payload = payload_of_size(&temp, "big.bin", 4096);
        let store = Arc::new(MemoryStore::new());
        store.flaky_part(1, 2);
        let transport = Transport::new(store.clone(), &config(payload.size() / 2));
        let key = storage_key("big.bin");

        transport
            .upload("b", &key, &payload, &CancellationToken::new())
            .await
            .unwrap();
        assert!(store.object("b", key.as_str()).is_some());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_uploads_nothing() {
        let temp = TempDir::new().unwrap();
        let payload = payload_of_size(&temp, "big.bin", 4096);
        let store = Arc::new(MemoryStore::new());
        let transport = Transport::new(store.clone(), &config(payload.size() / 2));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transport
            .upload("b", &storage_key("big.bin"), &payload, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_session_is_aborted() {
        let store = Arc::new(MemoryStore::new());
        let session = UploadSession::begin(
            store.clone(),
            "b",
            &storage_key("dist"),
            RetryConfig::no_retry(),
        )
        .await
        .unwrap();
        assert_eq!(store.open_uploads(), 1);

        drop(session);
        for _ in 0..10 {
            if store.open_uploads() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_session_dropped_during_complete_is_aborted() {
        let store = Arc::new(MemoryStore::new());
        store.stall_complete();
        let mut session = UploadSession::begin(
            store.clone(),
            "b",
            &storage_key("dist"),
            RetryConfig::no_retry(),
        )
        .await
        .unwrap();
        session.upload_part(Bytes::from_static(b"part")).await.unwrap();

        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(20), session.complete()).await;
        assert!(timed_out.is_err());

        for _ in 0..10 {
            if store.open_uploads() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.open_uploads(), 0);
        assert!(
            store
                .calls()
                .iter()
                .any(|c| matches!(c, StoreCall::AbortMultipartUpload { .. }))
        );
    }

    #[test]
    fn test_chunk_size_respects_part_limit() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let transport = Transport::new(store, &config(10));
        assert_eq!(transport.chunk_size(1_000), 10);
        assert_eq!(transport.chunk_size(1_000_000), 100);
    }
}
