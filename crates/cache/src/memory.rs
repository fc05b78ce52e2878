//! In-process object store
//!
//! Keeps objects and multipart uploads in memory, records every call in
//! order and supports injected failures. Used by the test suites of this
//! crate and of the binary.

use crate::store::{CompletedPart, ObjectMeta, ObjectStore, StoreError, StoreResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One recorded store call
#[derive(Debug, Clone, PartialEq, Eq)]
#[expect(missing_docs, reason = "fields mirror the ObjectStore arguments")]
pub enum StoreCall {
    PutObject { key: String, size: usize },
    GetObject { key: String },
    HeadObject { key: String },
    CreateMultipartUpload { key: String },
    UploadPart {
        key: String,
        upload_id: String,
        part_number: i32,
        size: usize,
    },
    CompleteMultipartUpload {
        key: String,
        upload_id: String,
        part_numbers: Vec<i32>,
    },
    AbortMultipartUpload { key: String, upload_id: String },
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_part: Option<i32>,
    flaky_part: Option<(i32, usize)>,
    fail_complete: bool,
    stall_complete: bool,
    fail_put: bool,
    failing_gets: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<(String, String), Bytes>,
    uploads: HashMap<String, PendingUpload>,
    calls: Vec<StoreCall>,
    faults: Faults,
    next_upload_id: u64,
}

/// Object store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object directly, bypassing the call log
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    /// Contents of a stored object
    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys of all objects in `bucket`, sorted
    #[must_use]
    pub fn object_keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Every call made so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    /// Forget the recorded calls
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of multipart uploads neither completed nor aborted
    #[must_use]
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Make every upload of `part_number` fail with a non-retryable error
    pub fn fail_part(&self, part_number: i32) {
        self.lock().faults.failing_part = Some(part_number);
    }

    /// Make the first `failures` uploads of `part_number` fail transiently
    pub fn flaky_part(&self, part_number: i32, failures: usize) {
        self.lock().faults.flaky_part = Some((part_number, failures));
    }

    /// Make `complete_multipart_upload` fail
    pub fn fail_complete(&self) {
        self.lock().faults.fail_complete = true;
    }

    /// Make `complete_multipart_upload` record its call and never return
    pub fn stall_complete(&self) {
        self.lock().faults.stall_complete = true;
    }

    /// Make `put_object` fail
    pub fn fail_put(&self) {
        self.lock().faults.fail_put = true;
    }

    /// Make `get_object` of `key` fail with a non-retryable error
    pub fn fail_get(&self, key: &str) {
        self.lock().faults.failing_gets.insert(key.to_string());
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.calls.push(StoreCall::PutObject {
            key: key.to_string(),
            size: body.len(),
        });
        if inner.faults.fail_put {
            return Err(StoreError::rejected("put_object", "injected failure"));
        }
        inner
            .objects
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str, dest: &Path) -> StoreResult<u64> {
        let body = {
            let mut inner = self.lock();
            inner.calls.push(StoreCall::GetObject {
                key: key.to_string(),
            });
            if inner.faults.failing_gets.contains(key) {
                return Err(StoreError::rejected("get_object", "injected failure"));
            }
            inner
                .objects
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| StoreError::not_found(key))?
        };
        tokio::fs::write(dest, &body)
            .await
            .map_err(|e| StoreError::io("get_object", e))?;
        Ok(body.len() as u64)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectMeta>> {
        let mut inner = self.lock();
        inner.calls.push(StoreCall::HeadObject {
            key: key.to_string(),
        });
        Ok(inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|body| ObjectMeta {
                size: body.len() as u64,
                etag: None,
            }))
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<String> {
        let mut inner = self.lock();
        inner.calls.push(StoreCall::CreateMultipartUpload {
            key: key.to_string(),
        });
        inner.next_upload_id += 1;
        let upload_id = format!("upload-{}", inner.next_upload_id);
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<String> {
        let mut inner = self.lock();
        inner.calls.push(StoreCall::UploadPart {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            part_number,
            size: body.len(),
        });

        if inner.faults.failing_part == Some(part_number) {
            return Err(StoreError::rejected("upload_part", "injected failure"));
        }
        if let Some((flaky, remaining)) = inner.faults.flaky_part.as_mut()
            && *flaky == part_number
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StoreError::request("upload_part", "injected transient failure"));
        }

        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::not_found(upload_id))?;
        let etag = format!("etag-{upload_id}-{part_number}");
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        let stall = {
            let mut inner = self.lock();
            inner.calls.push(StoreCall::CompleteMultipartUpload {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                part_numbers: parts.iter().map(|p| p.part_number).collect(),
            });
            inner.faults.stall_complete
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let mut inner = self.lock();
        if inner.faults.fail_complete {
            return Err(StoreError::rejected(
                "complete_multipart_upload",
                "injected failure",
            ));
        }

        let upload = inner
            .uploads
            .get(upload_id)
            .ok_or_else(|| StoreError::not_found(upload_id))?;
        let mut body = BytesMut::new();
        for (expected, part) in (1..).zip(parts) {
            let stored = upload
                .parts
                .get(&part.part_number)
                .filter(|(etag, _)| *etag == part.etag);
            match stored {
                Some((_, bytes)) if part.part_number == expected => body.extend_from_slice(bytes),
                _ => {
                    return Err(StoreError::rejected(
                        "complete_multipart_upload",
                        format!("invalid part {} in position {expected}", part.part_number),
                    ));
                }
            }
        }

        if let Some(upload) = inner.uploads.remove(upload_id) {
            inner
                .objects
                .insert((upload.bucket, upload.key), body.freeze());
        }
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.calls.push(StoreCall::AbortMultipartUpload {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        });
        inner
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(upload_id))
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_head_and_get() {
        let store = MemoryStore::new();
        store
            .put_object("b", "k", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let meta = store.head_object("b", "k").await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert!(store.head_object("b", "missing").await.unwrap().is_none());

        let temp = tempfile::NamedTempFile::new().unwrap();
        let n = store.get_object("b", "k", temp.path()).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(std::fs::read(temp.path()).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryStore::new();
        let temp = tempfile::NamedTempFile::new().unwrap();
        let err = store.get_object("b", "k", temp.path()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_multipart_assembles_in_order() {
        let store = MemoryStore::new();
        let id = store.create_multipart_upload("b", "k").await.unwrap();
        let e1 = store
            .upload_part("b", "k", &id, 1, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        let e2 = store
            .upload_part("b", "k", &id, 2, Bytes::from_static(b"cd"))
            .await
            .unwrap();
        store
            .complete_multipart_upload(
                "b",
                "k",
                &id,
                &[
                    CompletedPart { part_number: 1, etag: e1 },
                    CompletedPart { part_number: 2, etag: e2 },
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.object("b", "k").unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_complete_rejects_out_of_order_parts() {
        let store = MemoryStore::new();
        let id = store.create_multipart_upload("b", "k").await.unwrap();
        let e1 = store
            .upload_part("b", "k", &id, 1, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        let e2 = store
            .upload_part("b", "k", &id, 2, Bytes::from_static(b"cd"))
            .await
            .unwrap();
        let err = store
            .complete_multipart_upload(
                "b",
                "k",
                &id,
                &[
                    CompletedPart { part_number: 2, etag: e2 },
                    CompletedPart { part_number: 1, etag: e1 },
                ],
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(store.object("b", "k").is_none());
    }

    #[tokio::test]
    async fn test_abort_discards_upload() {
        let store = MemoryStore::new();
        let id = store.create_multipart_upload("b", "k").await.unwrap();
        store
            .upload_part("b", "k", &id, 1, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        store.abort_multipart_upload("b", "k", &id).await.unwrap();
        assert_eq!(store.open_uploads(), 0);
        assert!(store.object("b", "k").is_none());
        assert!(
            store
                .abort_multipart_upload("b", "k", &id)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_flaky_part_recovers() {
        let store = MemoryStore::new();
        store.flaky_part(1, 1);
        let id = store.create_multipart_upload("b", "k").await.unwrap();
        let first = store
            .upload_part("b", "k", &id, 1, Bytes::from_static(b"x"))
            .await;
        assert!(first.unwrap_err().is_transient());
        assert!(
            store
                .upload_part("b", "k", &id, 1, Bytes::from_static(b"x"))
                .await
                .is_ok()
        );
    }
}
