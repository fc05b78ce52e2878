//! Object store boundary
//!
//! Defines the `ObjectStore` trait the transfer pipeline is written against.
//! The S3 implementation lives in `cistash-aws`; [`crate::memory::MemoryStore`]
//! is an in-process implementation for tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use thiserror::Error;

/// Error returned by object store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object (or multipart upload) does not exist
    #[error("Object not found: {key}")]
    NotFound {
        /// Key of the missing object
        key: String,
    },

    /// The request failed (network, throttling, service error)
    #[error("{operation} request failed: {message}")]
    Request {
        /// Store operation name
        operation: &'static str,
        /// Error message from the client or service
        message: String,
        /// Whether retrying the request can succeed
        transient: bool,
    },

    /// Local I/O failed while streaming an object
    #[error("Local I/O failed during {operation}: {source}")]
    Io {
        /// Store operation name
        operation: &'static str,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Create a not-found error
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a transient request error
    #[must_use]
    pub fn request(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Request {
            operation,
            message: message.into(),
            transient: true,
        }
    }

    /// Create a request error that retrying cannot fix
    #[must_use]
    pub fn rejected(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Request {
            operation,
            message: message.into(),
            transient: false,
        }
    }

    /// Create a local I/O error
    #[must_use]
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// Returns true if the object does not exist
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if retrying the operation may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::NotFound { .. } => false,
            Self::Request { transient, .. } => *transient,
            Self::Io { .. } => true,
        }
    }
}

/// Result type for object store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Metadata returned by a `head_object` probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object size in bytes
    pub size: u64,
    /// Entity tag, without surrounding quotes
    pub etag: Option<String>,
}

/// One uploaded part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number, starting at 1
    pub part_number: i32,
    /// Integrity token returned by the store for this part
    pub etag: String,
}

/// Object store operations used by the transfer pipeline
///
/// Implementations must be thread-safe (`Send + Sync`) and cheap to share:
/// one client is reused for every concurrent path operation.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` as the whole object under `key`, replacing any previous object
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> StoreResult<()>;

    /// Stream the object under `key` into a new file at `dest`
    ///
    /// Returns the number of bytes written.
    async fn get_object(&self, bucket: &str, key: &str, dest: &Path) -> StoreResult<u64>;

    /// Probe for an object without downloading it
    ///
    /// Returns `Ok(None)` when the object does not exist.
    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectMeta>>;

    /// Start a multipart upload and return its upload id
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<String>;

    /// Upload one part and return its integrity token
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<String>;

    /// Assemble the uploaded parts into the final object
    ///
    /// `parts` must be complete and sorted by part number.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<()>;

    /// Discard a multipart upload and release its stored parts
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<()>;

    /// Provider name used in logs
    fn provider_name(&self) -> &'static str;
}
