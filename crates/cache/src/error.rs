//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use crate::store::StoreError;
use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(cistash::cache::io),
        help("Check file permissions and available space in the temporary directory")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// Missing or invalid configuration (credentials, bucket, settings)
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(cistash::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Input rejected before any transfer was attempted
    #[error("Validation error: {message}")]
    #[diagnostic(code(cistash::cache::validation))]
    Validation {
        /// Error message describing the rejected input
        message: String,
    },

    /// A local path requested for saving does not exist
    #[error("Path does not exist: {}", path.display())]
    #[diagnostic(
        code(cistash::cache::path_not_found),
        help("Paths are resolved relative to the working directory")
    )]
    PathNotFound {
        /// The missing path
        path: Box<Path>,
    },

    /// Object-store request failed
    #[error("{operation} failed for {storage_key}")]
    #[diagnostic(code(cistash::cache::transfer))]
    Transfer {
        /// Store operation that failed (e.g., "upload_part")
        operation: &'static str,
        /// Storage key the operation targeted
        storage_key: String,
        /// The underlying store error
        #[source]
        source: StoreError,
    },

    /// No stored object exists under the storage key
    #[error("Cache object not found: {storage_key}")]
    #[diagnostic(
        code(cistash::cache::not_found),
        help("The entry may have expired through the bucket's lifecycle rules or never existed")
    )]
    NotFound {
        /// The storage key that was not found
        storage_key: String,
    },

    /// Download, decompression or unpacking of a stored object failed
    #[error("Retrieval of {storage_key} failed: {message}")]
    #[diagnostic(code(cistash::cache::retrieval))]
    Retrieval {
        /// Storage key of the object being restored
        storage_key: String,
        /// Description of the failed step and its cause
        message: String,
    },

    /// Compressed stream or archive is malformed
    #[error("Malformed payload: {message}")]
    #[diagnostic(code(cistash::cache::format))]
    Format {
        /// Error message describing the malformed data
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(cistash::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// No candidate key restored and the caller asked to fail on a miss
    #[error("Cache miss: no entry found for key {key}{}", if fallbacks.is_empty() { String::new() } else { format!(" or restore keys {}", fallbacks.join(", ")) })]
    #[diagnostic(
        code(cistash::cache::miss),
        help("Disable fail-on-cache-miss to continue with an empty cache")
    )]
    CacheMiss {
        /// The primary key
        key: String,
        /// Fallback keys that were tried
        fallbacks: Vec<String>,
    },

    /// The operation was cancelled before it completed
    #[error("Operation cancelled")]
    #[diagnostic(code(cistash::cache::cancelled))]
    Cancelled,
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a validation error
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a path-not-found error
    #[must_use]
    pub fn path_not_found(path: impl AsRef<Path>) -> Self {
        Self::PathNotFound {
            path: path.as_ref().into(),
        }
    }

    /// Wrap a store error, keeping not-found distinct from transfer failures
    #[must_use]
    pub fn transfer(
        operation: &'static str,
        storage_key: impl Into<String>,
        source: StoreError,
    ) -> Self {
        let storage_key = storage_key.into();
        if source.is_not_found() {
            return Self::NotFound { storage_key };
        }
        Self::Transfer {
            operation,
            storage_key,
            source,
        }
    }

    /// Create a retrieval error
    #[must_use]
    pub fn retrieval(storage_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Retrieval {
            storage_key: storage_key.into(),
            message: message.into(),
        }
    }

    /// Create a format error
    #[must_use]
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Whether this error aborts the whole save or restore operation.
    ///
    /// Transfer, retrieval and format errors are recovered per path or per
    /// candidate key and never reach this classification as fatal.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::CacheMiss { .. } | Self::Cancelled
        )
    }

    /// Whether this error only skips the operation (soft outcome)
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_not_found_maps_to_not_found() {
        let err = Error::transfer("get_object", "v1/abc-dist", StoreError::not_found("v1/abc-dist"));
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_transfer_request_error_is_kept() {
        let err = Error::transfer(
            "upload_part",
            "v1/abc-dist",
            StoreError::request("upload_part", "connection reset"),
        );
        assert!(matches!(err, Error::Transfer { operation: "upload_part", .. }));
        assert_eq!(err.to_string(), "upload_part failed for v1/abc-dist");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::configuration("missing bucket").is_fatal());
        assert!(Error::Cancelled.is_fatal());
        assert!(
            Error::CacheMiss {
                key: "v1".into(),
                fallbacks: vec![]
            }
            .is_fatal()
        );
        assert!(!Error::retrieval("k", "corrupt").is_fatal());
        assert!(!Error::validation("empty key").is_fatal());
        assert!(Error::validation("empty key").is_validation());
    }

    #[test]
    fn test_cache_miss_message_lists_fallbacks() {
        let err = Error::CacheMiss {
            key: "v2".into(),
            fallbacks: vec!["v1".into(), "v0".into()],
        };
        assert_eq!(
            err.to_string(),
            "Cache miss: no entry found for key v2 or restore keys v1, v0"
        );
    }

    #[test]
    fn test_io_error_display_includes_path() {
        let err = Error::io(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "/tmp/payload",
            "open",
        );
        assert_eq!(err.to_string(), "I/O open failed: /tmp/payload");
    }
}
