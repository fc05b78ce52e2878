use crate::tracing::{LogLevel, TracingFormat};
use cistash_cache::{MIN_PART_SIZE, RetryConfig, TransferConfig};
use clap::{Args, Parser, Subcommand};
use miette::{Diagnostic, Report};
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the CLI application
pub const EXIT_OK: i32 = 0;
/// Operation failure exit code (fail-on-cache-miss, cancellation, unexpected errors)
pub const EXIT_FAILURE: i32 = 1;
/// CLI or configuration error exit code
pub const EXIT_CLI: i32 = 2;

/// CLI-specific error types with proper exit code mapping
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum CliError {
    /// CLI or configuration error (exit code 2)
    #[error("Configuration error: {message}")]
    #[diagnostic(code(cistash::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Save or restore failed as a whole (exit code 1)
    #[error("{message}")]
    #[diagnostic(code(cistash::cli::operation))]
    Operation {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new configuration error with help text
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create a new operation error
    #[must_use]
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
            help: None,
        }
    }

    /// The error message without the category prefix
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Config { message, .. } | Self::Operation { message, .. } => message,
        }
    }
}

/// Configuration errors keep exit code 2, everything else fails the operation.
impl From<cistash_cache::Error> for CliError {
    fn from(err: cistash_cache::Error) -> Self {
        let help = err.help().map(|h| h.to_string());
        match err {
            // Extract the message to avoid a doubled "configuration error" prefix
            cistash_cache::Error::Configuration { message } => Self::Config { message, help },
            other => Self::Operation {
                message: other.to_string(),
                help,
            },
        }
    }
}

/// Map CLI error to appropriate exit code
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. } => EXIT_CLI,
        CliError::Operation { .. } => EXIT_FAILURE,
    }
}

/// Render an error on stderr, plus an `::error::` annotation inside Actions
#[allow(clippy::print_stderr)]
pub fn render_error(err: &CliError, annotate: bool) {
    let report = Report::new(err.clone());
    eprintln!("{report:?}");
    let _ = io::stderr().flush();

    if annotate {
        // Workflow commands are read from stdout
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "::error::{}", escape_annotation(&err.to_string()));
        let _ = out.flush();
    }
}

/// Escape a message for a workflow command
fn escape_annotation(message: &str) -> String {
    message
        .replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

/// Parse a part size in bytes, rejecting values S3 would refuse
fn parse_part_size(value: &str) -> Result<u64, String> {
    let size: u64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid part size '{value}': {e}"))?;
    if size < MIN_PART_SIZE {
        return Err(format!(
            "part size must be at least {MIN_PART_SIZE} bytes (5 MiB), got {size}"
        ));
    }
    Ok(size)
}

/// Command line of the `cistash` binary
#[derive(Parser, Debug)]
#[command(name = "cistash")]
#[command(about = "Remote cache for CI pipelines backed by S3-compatible object storage")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    /// Operation to run
    #[command(subcommand)]
    pub command: Commands,

    /// Level for the cistash crates when `RUST_LOG` is unset
    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Set logging level",
        default_value = "info",
        value_enum
    )]
    pub level: LogLevel,

    /// Log line format
    #[arg(
        long,
        global = true,
        help = "Log output format",
        default_value = "compact",
        value_enum
    )]
    pub log_format: TracingFormat,
}

/// Cache operations
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Restore phase, run before the build
    #[command(about = "Restore paths from the best matching cache key")]
    Restore(RestoreArgs),
    /// Save phase, run after the build
    #[command(about = "Save paths under the primary cache key")]
    Save(SaveArgs),
}

impl Commands {
    /// Store and state options shared by both commands
    #[must_use]
    pub const fn store_args(&self) -> &StoreArgs {
        match self {
            Self::Restore(args) => &args.store,
            Self::Save(args) => &args.store,
        }
    }
}

/// Options shared by `restore` and `save`
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, env = "CISTASH_BUCKET", help = "Bucket holding the cache")]
    pub bucket: String,

    #[arg(long, env = "CISTASH_PREFIX", help = "Namespace prepended to every object key")]
    pub prefix: Option<String>,

    #[arg(
        long,
        env = "CISTASH_ENDPOINT",
        help = "Endpoint of an S3-compatible store (enables path-style addressing)"
    )]
    pub endpoint: Option<String>,

    #[arg(
        long,
        env = "CISTASH_PART_SIZE",
        help = "Single-upload threshold and multipart chunk size in bytes",
        default_value_t = MIN_PART_SIZE,
        value_parser = parse_part_size
    )]
    pub part_size: u64,

    #[arg(
        long,
        env = "CISTASH_CONCURRENCY",
        help = "Paths transferred concurrently",
        default_value_t = 4,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub concurrency: u16,

    #[arg(
        long,
        env = "CISTASH_COMPRESSION_LEVEL",
        help = "zstd compression level",
        default_value_t = 3,
        value_parser = clap::value_parser!(i32).range(1..=22)
    )]
    pub compression_level: i32,

    #[arg(
        long,
        env = "RUNNER_TEMP",
        help = "Directory for temporary archives (system temp dir when unset)"
    )]
    pub temp_dir: Option<PathBuf>,

    #[arg(
        long,
        help = "Run without cross-phase state (save always uploads)"
    )]
    pub standalone: bool,

    #[arg(
        long,
        env = "CISTASH_STATE_FILE",
        help = "JSON file carrying state from restore to save outside Actions"
    )]
    pub state_file: Option<PathBuf>,
}

impl StoreArgs {
    /// Transfer settings for these options
    #[must_use]
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            part_size: self.part_size,
            concurrency: usize::from(self.concurrency),
            compression_level: self.compression_level,
            temp_dir: self.temp_dir.clone(),
            retry: RetryConfig::default(),
        }
    }
}

/// Options of `cistash restore`
#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    #[arg(long, env = "INPUT_KEY", help = "Primary cache key")]
    pub key: Option<String>,

    #[arg(
        long = "path",
        env = "INPUT_PATH",
        required = true,
        help = "Path to restore (repeatable, or a newline-separated list)"
    )]
    pub paths: Vec<String>,

    #[arg(
        long = "restore-keys",
        env = "INPUT_RESTORE-KEYS",
        help = "Fallback keys tried in order (repeatable, or a newline-separated list)"
    )]
    pub restore_keys: Vec<String>,

    #[arg(
        long,
        env = "INPUT_FAIL-ON-CACHE-MISS",
        help = "Fail the job when no key matches"
    )]
    pub fail_on_cache_miss: bool,

    #[arg(
        long,
        env = "INPUT_LOOKUP-ONLY",
        help = "Check for a match without downloading"
    )]
    pub lookup_only: bool,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Options of `cistash save`
#[derive(Args, Debug, Clone)]
pub struct SaveArgs {
    #[arg(
        long,
        env = "INPUT_KEY",
        help = "Primary cache key (the restore phase's key takes precedence)"
    )]
    pub key: Option<String>,

    #[arg(
        long = "path",
        env = "INPUT_PATH",
        required = true,
        help = "Path to save (repeatable, or a newline-separated list)"
    )]
    pub paths: Vec<String>,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Parse the process arguments, exiting with a usage error on failure
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN_ENV: [(&str, Option<&str>); 9] = [
        ("INPUT_KEY", None),
        ("INPUT_PATH", None),
        ("INPUT_RESTORE-KEYS", None),
        ("INPUT_FAIL-ON-CACHE-MISS", None),
        ("INPUT_LOOKUP-ONLY", None),
        ("CISTASH_BUCKET", None),
        ("CISTASH_PART_SIZE", None),
        ("CISTASH_STATE_FILE", None),
        ("RUNNER_TEMP", None),
    ];

    #[test]
    fn test_restore_defaults() {
        temp_env::with_vars(CLEAN_ENV, || {
            let cli = Cli::try_parse_from([
                "cistash", "restore", "--key", "v1", "--path", "dist", "--bucket", "ci",
            ])
            .unwrap();

            assert_eq!(cli.level, LogLevel::Info);
            assert_eq!(cli.log_format, TracingFormat::Compact);
            let Commands::Restore(args) = cli.command else {
                unreachable!("parsed a restore command");
            };
            assert_eq!(args.key.as_deref(), Some("v1"));
            assert_eq!(args.paths, vec!["dist"]);
            assert!(args.restore_keys.is_empty());
            assert!(!args.fail_on_cache_miss);
            assert!(!args.lookup_only);
            assert_eq!(args.store.part_size, MIN_PART_SIZE);
            assert_eq!(args.store.concurrency, 4);
            assert!(!args.store.standalone);
        });
    }

    #[test]
    fn test_restore_reads_action_inputs() {
        temp_env::with_vars(
            [
                ("INPUT_KEY", Some("deps-v2")),
                ("INPUT_PATH", Some("node_modules\ndist")),
                ("INPUT_RESTORE-KEYS", Some("deps-v1\ndeps-")),
                ("INPUT_FAIL-ON-CACHE-MISS", Some("true")),
                ("INPUT_LOOKUP-ONLY", Some("false")),
                ("CISTASH_BUCKET", Some("ci-cache")),
                ("CISTASH_PART_SIZE", None),
                ("CISTASH_STATE_FILE", None),
                ("RUNNER_TEMP", Some("/runner/_temp")),
            ],
            || {
                let cli = Cli::try_parse_from(["cistash", "restore"]).unwrap();
                let Commands::Restore(args) = cli.command else {
                    unreachable!("parsed a restore command");
                };
                assert_eq!(args.key.as_deref(), Some("deps-v2"));
                assert_eq!(
                    crate::github::parse_list(&args.paths),
                    vec!["node_modules", "dist"]
                );
                assert_eq!(
                    crate::github::parse_list(&args.restore_keys),
                    vec!["deps-v1", "deps-"]
                );
                assert!(args.fail_on_cache_miss);
                assert!(!args.lookup_only);
                assert_eq!(args.store.bucket, "ci-cache");
                assert_eq!(
                    args.store.transfer_config().temp_dir,
                    Some(PathBuf::from("/runner/_temp"))
                );
            },
        );
    }

    #[test]
    fn test_part_size_below_minimum_is_rejected() {
        temp_env::with_vars(CLEAN_ENV, || {
            let result = Cli::try_parse_from([
                "cistash", "save", "--path", "dist", "--bucket", "ci", "--part-size", "1024",
            ]);
            assert!(result.is_err());

            let cli = Cli::try_parse_from([
                "cistash",
                "save",
                "--path",
                "dist",
                "--bucket",
                "ci",
                "--part-size",
                "16777216",
            ])
            .unwrap();
            assert_eq!(cli.command.store_args().part_size, 16 * 1024 * 1024);
        });
    }

    #[test]
    fn test_missing_bucket_is_a_usage_error() {
        temp_env::with_vars(CLEAN_ENV, || {
            let err = Cli::try_parse_from(["cistash", "save", "--path", "dist"]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
        });
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        temp_env::with_vars(CLEAN_ENV, || {
            let result = Cli::try_parse_from([
                "cistash", "save", "--path", "dist", "--bucket", "ci", "--concurrency", "0",
            ]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_missing_subcommand() {
        assert!(Cli::try_parse_from(["cistash"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&CliError::config("no bucket")), EXIT_CLI);
        assert_eq!(exit_code_for(&CliError::operation("cancelled")), EXIT_FAILURE);
    }

    #[test]
    fn test_cache_errors_map_to_cli_errors() {
        let config: CliError = cistash_cache::Error::configuration("Missing AWS credentials").into();
        assert!(matches!(config, CliError::Config { .. }));
        assert_eq!(config.message(), "Missing AWS credentials");

        let miss: CliError = cistash_cache::Error::CacheMiss {
            key: "v2".into(),
            fallbacks: vec!["v1".into()],
        }
        .into();
        assert_eq!(exit_code_for(&miss), EXIT_FAILURE);
        assert!(matches!(miss, CliError::Operation { help: Some(_), .. }));

        let cancelled: CliError = cistash_cache::Error::Cancelled.into();
        assert_eq!(exit_code_for(&cancelled), EXIT_FAILURE);
    }

    #[test]
    fn test_escape_annotation() {
        assert_eq!(escape_annotation("a\nb 100%"), "a%0Ab 100%25");
    }
}
