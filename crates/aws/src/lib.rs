//! AWS integration for cistash
//!
//! Provides the S3 implementation of [`cistash_cache::ObjectStore`]:
//! - [`S3Settings`]: static credentials, region and optional custom endpoint
//! - [`S3Store`]: put, get, head and multipart operations on `aws-sdk-s3`

pub mod s3;
pub mod settings;

// Re-export main types for convenience
pub use s3::S3Store;
pub use settings::S3Settings;
