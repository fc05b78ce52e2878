//! `restore` and `save` command implementations
//!
//! [`execute`] wires the real S3 store and the pipeline environment together;
//! [`run_restore`] and [`run_save`] take every collaborator as an argument so
//! they run unchanged against an in-memory store.

mod restore;
mod save;

pub use restore::run_restore;
pub use save::run_save;

use crate::cli::{CliError, Commands, StoreArgs};
use crate::github::{self, GithubStateProvider, Outputs};
use cistash_aws::{S3Settings, S3Store};
use cistash_cache::{
    Error, FileStateProvider, NullStateProvider, ObjectStore, Stash, StateProvider,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run a parsed command against the configured S3 bucket
pub async fn execute(command: Commands, cancel: &CancellationToken) -> Result<(), CliError> {
    if let Err(err) = github::validate_event() {
        return skip(&err);
    }

    let store_args = command.store_args();
    let settings = S3Settings::from_env()?.with_endpoint(store_args.endpoint.clone());
    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(&settings).await);
    let state = state_provider(store_args);
    let outputs = Outputs::from_env();

    match &command {
        Commands::Restore(args) => {
            run_restore(args, store, state.as_ref(), &outputs, cancel).await
        }
        Commands::Save(args) => run_save(args, store, state.as_ref(), &outputs, cancel).await,
    }
}

/// Pick where restore-phase state is kept
///
/// `--standalone` disables state, an explicit state file wins over the Actions
/// state file, and outside Actions without a state file nothing is kept.
#[must_use]
pub fn state_provider(args: &StoreArgs) -> Box<dyn StateProvider> {
    if args.standalone {
        debug!("Standalone run, cross-phase state disabled");
        return Box::new(NullStateProvider);
    }
    if let Some(path) = &args.state_file {
        debug!(path = %path.display(), "Using state file");
        return Box::new(FileStateProvider::new(path));
    }
    if let Some(provider) = GithubStateProvider::from_env() {
        return Box::new(provider);
    }
    debug!("No state file available, cross-phase state disabled");
    Box::new(NullStateProvider)
}

/// Log a soft validation failure; the operation is skipped and the job continues
fn skip(err: &Error) -> Result<(), CliError> {
    warn!("{err}");
    Ok(())
}

/// Expand the path inputs, requiring at least one
fn input_paths(values: &[String]) -> Result<Vec<PathBuf>, CliError> {
    let paths: Vec<PathBuf> = github::parse_list(values)
        .into_iter()
        .map(PathBuf::from)
        .collect();
    if paths.is_empty() {
        return Err(CliError::config_with_help(
            "No paths to cache were given",
            "Pass --path or set INPUT_PATH to one or more paths",
        ));
    }
    Ok(paths)
}

fn open_stash(store: Arc<dyn ObjectStore>, args: &StoreArgs) -> Result<Stash, CliError> {
    Ok(Stash::new(
        store,
        args.bucket.clone(),
        args.prefix.clone(),
        args.transfer_config(),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cistash_cache::StateKey;
    use tempfile::TempDir;

    fn store_args(standalone: bool, state_file: Option<PathBuf>) -> StoreArgs {
        StoreArgs {
            bucket: "ci-cache".into(),
            prefix: None,
            endpoint: None,
            part_size: cistash_cache::MIN_PART_SIZE,
            concurrency: 4,
            compression_level: 3,
            temp_dir: None,
            standalone,
            state_file,
        }
    }

    #[test]
    fn test_standalone_keeps_no_state() {
        let temp = TempDir::new().unwrap();
        let state = state_provider(&store_args(true, Some(temp.path().join("state.json"))));
        state.set_state(StateKey::PrimaryKey, "v1").unwrap();
        assert_eq!(state.get_state(StateKey::PrimaryKey).unwrap(), None);
        assert!(!temp.path().join("state.json").exists());
    }

    #[test]
    fn test_state_file_is_used_when_given() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        let state = state_provider(&store_args(false, Some(path.clone())));
        state.set_state(StateKey::PrimaryKey, "v1").unwrap();
        assert!(path.is_file());
        assert_eq!(
            state.get_state(StateKey::PrimaryKey).unwrap().as_deref(),
            Some("v1")
        );
    }

    #[test]
    fn test_no_state_outside_actions() {
        temp_env::with_var(github::ENV_STATE, None::<&str>, || {
            let state = state_provider(&store_args(false, None));
            state.set_state(StateKey::MatchedKey, "v1").unwrap();
            assert_eq!(state.get_state(StateKey::MatchedKey).unwrap(), None);
        });
    }

    #[test]
    fn test_input_paths_require_one_entry() {
        let err = input_paths(&["\n  \n".to_string()]).unwrap_err();
        assert!(matches!(err, CliError::Config { .. }));
        assert_eq!(
            input_paths(&["dist\ntarget".to_string()]).unwrap(),
            vec![PathBuf::from("dist"), PathBuf::from("target")]
        );
    }

    #[test]
    fn test_empty_bucket_is_a_configuration_error() {
        let mut args = store_args(true, None);
        args.bucket = " ".into();
        let err = open_stash(Arc::new(cistash_cache::MemoryStore::new()), &args).unwrap_err();
        assert!(matches!(err, CliError::Config { .. }));
    }
}
