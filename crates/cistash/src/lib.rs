//! cistash - remote cache for CI pipelines
//!
//! Restores and saves build artifacts in an S3-compatible bucket. The
//! transfer pipeline lives in [`cistash_cache`] and the S3 client in
//! [`cistash_aws`]; this crate adds the command line, the GitHub Actions
//! boundary (inputs, outputs and state files) and process concerns such as
//! logging, signals and exit codes.

/// CLI argument parsing and exit codes.
pub mod cli;
/// `restore` and `save` command implementations.
pub mod commands;
/// GitHub Actions inputs, outputs and state.
pub mod github;
/// Signal handling and cancellation.
pub mod shutdown;
/// Tracing and logging configuration.
pub mod tracing;

pub use cli::{CliError, EXIT_CLI, EXIT_FAILURE, EXIT_OK};
