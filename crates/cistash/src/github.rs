//! GitHub Actions pipeline boundary
//!
//! Actions talks to a step through files named in the environment: outputs are
//! appended to `GITHUB_OUTPUT`, state for the post step to `GITHUB_STATE`, and
//! the runner hands saved state back as `STATE_<NAME>` variables.

use cistash_cache::{Error, Result, StateKey, StateProvider};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Set to `true` by the runner for every step
pub const ENV_ACTIONS: &str = "GITHUB_ACTIONS";
/// Ref that triggered the workflow
pub const ENV_REF: &str = "GITHUB_REF";
/// File receiving step outputs
pub const ENV_OUTPUT: &str = "GITHUB_OUTPUT";
/// File receiving state for the post step
pub const ENV_STATE: &str = "GITHUB_STATE";

/// Output: `true` on an exact hit of the primary key
pub const OUTPUT_CACHE_HIT: &str = "cache-hit";
/// Output: `exact`, `fallback` or `miss`
pub const OUTPUT_CACHE_OUTCOME: &str = "cache-outcome";
/// Output: key the restore resolved to, empty on a miss
pub const OUTPUT_MATCHED_KEY: &str = "cache-matched-key";
/// Output: primary key of the run
pub const OUTPUT_PRIMARY_KEY: &str = "cache-primary-key";
/// Output: `true` when every path was saved
pub const OUTPUT_CACHE_SAVED: &str = "cache-saved";

/// Whether the process runs as a GitHub Actions step
#[must_use]
pub fn is_actions() -> bool {
    std::env::var(ENV_ACTIONS).is_ok_and(|v| v == "true")
}

/// Reject runs whose trigger carries no ref
///
/// Caches are scoped by ref, so events without one (some `workflow_run` and
/// `repository_dispatch` setups) are unsupported. Outside Actions this always
/// passes.
pub fn validate_event() -> Result<()> {
    if !is_actions() {
        return Ok(());
    }
    match std::env::var(ENV_REF) {
        Ok(r) if !r.trim().is_empty() => Ok(()),
        _ => Err(Error::validation(format!(
            "Event is not supported because it has no {ENV_REF}; caching is skipped"
        ))),
    }
}

/// Split multi-line inputs into trimmed, non-empty entries
///
/// Each value may itself hold several newline-separated entries, which is how
/// Actions passes list inputs through `INPUT_*` variables.
#[must_use]
pub fn parse_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.lines())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Append a `name<<delimiter` block to an Actions command file
fn append_command(path: &Path, name: &str, value: &str) -> Result<()> {
    let delimiter = format!("ghadelimiter_{}", Uuid::new_v4());
    if name.contains(&delimiter) || value.contains(&delimiter) {
        return Err(Error::validation(format!(
            "Value for {name} contains the command delimiter"
        )));
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::io(e, path, "open"))?;
    writeln!(file, "{name}<<{delimiter}\n{value}\n{delimiter}")
        .map_err(|e| Error::io(e, path, "append"))
}

/// Destination of step outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outputs {
    /// Append to the Actions output file
    File(PathBuf),
    /// Print `name=value` lines on stdout
    Stdout,
}

impl Outputs {
    /// Use `GITHUB_OUTPUT` when set, stdout otherwise
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var_os(ENV_OUTPUT)
            .filter(|v| !v.is_empty())
            .map_or(Self::Stdout, |p| Self::File(PathBuf::from(p)))
    }

    /// Publish one output
    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        tracing::debug!(name, value, "Setting output");
        match self {
            Self::File(path) => append_command(path, name, value),
            Self::Stdout => {
                let mut out = std::io::stdout().lock();
                writeln!(out, "{name}={value}").map_err(|e| Error::io_no_path(e, "write output"))
            }
        }
    }
}

/// State provider backed by the Actions state file
#[derive(Debug, Clone)]
pub struct GithubStateProvider {
    path: PathBuf,
}

impl GithubStateProvider {
    /// Write state to `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Use the file named by `GITHUB_STATE`, if any
    #[must_use]
    pub fn from_env() -> Option<Self> {
        std::env::var_os(ENV_STATE)
            .filter(|v| !v.is_empty())
            .map(Self::new)
    }

    /// Environment variable the runner uses to hand `key` to the post step
    #[must_use]
    pub fn env_name(key: StateKey) -> String {
        format!("STATE_{}", key.name())
    }
}

impl StateProvider for GithubStateProvider {
    fn set_state(&self, key: StateKey, value: &str) -> Result<()> {
        append_command(&self.path, key.name(), value)
    }

    fn get_state(&self, key: StateKey) -> Result<Option<String>> {
        Ok(std::env::var(Self::env_name(key))
            .ok()
            .filter(|v| !v.is_empty()))
    }
}
