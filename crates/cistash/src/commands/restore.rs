use super::{input_paths, open_stash, skip};
use crate::cli::{CliError, RestoreArgs};
use crate::github::{
    self, OUTPUT_CACHE_HIT, OUTPUT_CACHE_OUTCOME, OUTPUT_MATCHED_KEY, OUTPUT_PRIMARY_KEY, Outputs,
};
use cistash_cache::{
    CacheKey, CacheStatus, Error, ObjectStore, RestoreOutcome, RestoreRequest, StateKey,
    StateProvider,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Restore the requested paths and publish the outcome
///
/// Invalid keys skip the restore with a warning. A miss is only an error when
/// `--fail-on-cache-miss` is set; the outputs are written either way.
#[instrument(name = "restore_command", skip_all)]
pub async fn run_restore(
    args: &RestoreArgs,
    store: Arc<dyn ObjectStore>,
    state: &dyn StateProvider,
    outputs: &Outputs,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    // Values left by an earlier run must not leak into this job's save
    state.clear_state(StateKey::PrimaryKey)?;
    state.clear_state(StateKey::MatchedKey)?;

    let (primary, restore_keys) = match parse_keys(args) {
        Ok(keys) => keys,
        Err(err) if err.is_validation() => return skip(&err),
        Err(err) => return Err(err.into()),
    };
    let paths = input_paths(&args.paths)?;

    state.set_state(StateKey::PrimaryKey, primary.as_str())?;
    outputs.set(OUTPUT_PRIMARY_KEY, primary.as_str())?;

    let stash = open_stash(store, &args.store)?;
    let request = RestoreRequest::new(primary, paths)
        .with_restore_keys(restore_keys)
        .fail_on_miss(args.fail_on_cache_miss)
        .lookup_only(args.lookup_only);

    match stash.restore(&request, cancel).await {
        Ok(outcome) => {
            if let Some(resolved) = &outcome.resolved_key {
                state.set_state(StateKey::MatchedKey, resolved.as_str())?;
            }
            publish(outputs, &outcome)?;
            report(&request, &outcome);
            Ok(())
        }
        Err(err @ Error::CacheMiss { .. }) => {
            publish(outputs, &RestoreOutcome::miss())?;
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

fn parse_keys(args: &RestoreArgs) -> cistash_cache::Result<(CacheKey, Vec<CacheKey>)> {
    let primary = CacheKey::new(args.key.clone().unwrap_or_default())?;
    let restore_keys = github::parse_list(&args.restore_keys)
        .into_iter()
        .map(CacheKey::new)
        .collect::<cistash_cache::Result<Vec<_>>>()?;
    Ok((primary, restore_keys))
}

fn publish(outputs: &Outputs, outcome: &RestoreOutcome) -> cistash_cache::Result<()> {
    let status = outcome.status();
    outputs.set(
        OUTPUT_CACHE_HIT,
        if status == CacheStatus::ExactHit {
            "true"
        } else {
            "false"
        },
    )?;
    outputs.set(OUTPUT_CACHE_OUTCOME, status.as_str())?;
    outputs.set(
        OUTPUT_MATCHED_KEY,
        outcome
            .resolved_key
            .as_ref()
            .map_or("", CacheKey::as_str),
    )
}

fn report(request: &RestoreRequest, outcome: &RestoreOutcome) {
    match (&outcome.resolved_key, request.lookup_only) {
        (Some(key), true) => {
            info!(key = %key, status = %outcome.status(), "Cache found and can be restored");
        }
        (Some(key), false) => info!(
            key = %key,
            status = %outcome.status(),
            paths = outcome.restored_paths.len(),
            "Cache restored"
        ),
        (None, _) => {
            let keys: Vec<&str> = std::iter::once(&request.primary_key)
                .chain(&request.restore_keys)
                .map(CacheKey::as_str)
                .collect();
            info!("Cache not found for input keys: {}", keys.join(", "));
        }
    }
}
