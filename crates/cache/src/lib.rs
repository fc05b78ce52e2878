//! Artifact transfer core for cistash
//!
//! This crate stores named, versioned filesystem artifacts in an S3-style
//! object store and brings them back:
//! - Archiving and zstd compression of files and directories
//! - Single-request or multipart upload with guaranteed abort on failure
//! - Download, decompression and format sniffing on restore
//! - Resolution of a primary key and ordered fallback keys
//!
//! # Overview
//!
//! [`Stash`] is the entry point. `save` packs and uploads every path under a
//! [`CacheKey`] and reports per-path outcomes in a [`SaveReport`]. `restore`
//! resolves a [`RestoreRequest`] to an exact hit, a fallback hit or a miss.
//!
//! The object store is reached through the [`ObjectStore`] trait; the S3
//! implementation lives in `cistash-aws` and [`MemoryStore`] serves tests.
//!
//! # Storage keys
//!
//! Each (cache key, path) pair maps to one object:
//! `{prefix/}{cache-key}/{sha256(path)[..16]}-{basename}`.

// TODO(cache-docs): Add # Errors documentation to all fallible public functions
#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

pub mod archive;
mod cache;
pub mod config;
mod error;
pub mod key;
pub mod memory;
pub mod resolver;
pub mod retrieve;
pub mod retry;
pub mod state;
pub mod store;
pub mod transport;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use archive::{Payload, PayloadFormat, PayloadKind, RestoredArtifact};
pub use cache::{RestoreRequest, SaveReport, Stash};
pub use config::{MIN_PART_SIZE, RetryConfig, TransferConfig};
pub use key::{CacheKey, MAX_KEY_LENGTH, StorageKey, keys_match};
pub use memory::MemoryStore;
pub use resolver::{CacheStatus, KeyResolver, ResolveState, RestoreOutcome};
pub use retrieve::Retriever;
pub use state::{FileStateProvider, NullStateProvider, StateKey, StateProvider};
pub use store::{CompletedPart, ObjectMeta, ObjectStore, StoreError, StoreResult};
pub use transport::{Transport, UploadSession, UploadStrategy};
