use super::{input_paths, open_stash, skip};
use crate::cli::{CliError, SaveArgs};
use crate::github::{OUTPUT_CACHE_SAVED, Outputs};
use cistash_cache::{CacheKey, ObjectStore, StateKey, StateProvider, keys_match};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Save the requested paths under the primary key
///
/// The primary key recorded by the restore phase takes precedence over
/// `--key`. When the restore already matched the primary key the upload is
/// skipped. Paths that fail are logged and reported through `cache-saved`
/// without failing the job.
#[instrument(name = "save_command", skip_all)]
pub async fn run_save(
    args: &SaveArgs,
    store: Arc<dyn ObjectStore>,
    state: &dyn StateProvider,
    outputs: &Outputs,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    let raw_key = match state.get_state(StateKey::PrimaryKey)?.filter(|k| !k.is_empty()) {
        Some(key) => key,
        None => args.key.clone().unwrap_or_default(),
    };
    let primary = match CacheKey::new(raw_key) {
        Ok(key) => key,
        Err(err) if err.is_validation() => return skip(&err),
        Err(err) => return Err(err.into()),
    };

    if let Some(matched) = state.get_state(StateKey::MatchedKey)?
        && !matched.is_empty()
        && keys_match(&matched, primary.as_str())
    {
        info!(key = %primary, "Cache hit occurred on the primary key, not saving cache");
        outputs.set(OUTPUT_CACHE_SAVED, "false")?;
        return Ok(());
    }

    let paths = input_paths(&args.paths)?;
    let stash = open_stash(store, &args.store)?;

    let report = match stash.save(&primary, &paths, cancel).await {
        Ok(report) => report,
        Err(err) if err.is_validation() => return skip(&err),
        Err(err) => return Err(err.into()),
    };

    if report.is_success() {
        info!(key = %primary, paths = report.succeeded.len(), "Cache saved");
    } else if report.is_total_failure() {
        warn!(key = %primary, "Cache not saved, every path failed");
    } else {
        warn!(
            key = %primary,
            saved = report.succeeded.len(),
            failed = report.failed.len(),
            "Cache saved partially"
        );
    }
    outputs.set(
        OUTPUT_CACHE_SAVED,
        if report.is_success() { "true" } else { "false" },
    )?;
    Ok(())
}
