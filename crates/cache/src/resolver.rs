//! Resolution of the primary and fallback keys to one stored entry
//!
//! Candidates are tried in order: the primary key, then each restore key.
//! A candidate is probed first (every path must exist under it) and only then
//! downloaded. Each path is unpacked into a staging directory and nothing is
//! moved to its destination until every path of the candidate has staged. If
//! any path fails, the staged paths are discarded and the next candidate is
//! tried, so restored paths never come from two different keys.

use crate::config::RetryConfig;
use crate::key::{CacheKey, StorageKey, keys_match};
use crate::retrieve::{Retriever, StagedRestore};
use crate::retry::retry_with_backoff;
use crate::store::ObjectStore;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Outcome class of a restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheStatus {
    /// The primary key restored
    #[serde(rename = "exact")]
    ExactHit,
    /// A restore key restored
    #[serde(rename = "fallback")]
    FallbackHit,
    /// Nothing restored
    #[serde(rename = "miss")]
    Miss,
}

impl CacheStatus {
    /// Short name used in pipeline outputs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExactHit => "exact",
            Self::FallbackHit => "fallback",
            Self::Miss => "miss",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveState {
    /// Nothing tried yet
    Pending,
    /// Probing or fetching a candidate
    Trying(CacheKey),
    /// The primary key resolved
    ExactHit(CacheKey),
    /// A restore key resolved
    FallbackHit(CacheKey),
    /// Every candidate failed
    Miss,
}

impl ResolveState {
    /// Whether resolution has finished
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::ExactHit(_) | Self::FallbackHit(_) | Self::Miss)
    }
}

/// Result of resolving a restore request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Key the entry was restored from
    pub resolved_key: Option<CacheKey>,
    /// Whether `resolved_key` is the primary key
    pub exact: bool,
    /// Paths written to disk (empty for lookup-only hits)
    pub restored_paths: BTreeSet<PathBuf>,
}

impl RestoreOutcome {
    /// A restore that found nothing
    #[must_use]
    pub fn miss() -> Self {
        Self::default()
    }

    /// Outcome class
    #[must_use]
    pub const fn status(&self) -> CacheStatus {
        match (&self.resolved_key, self.exact) {
            (None, _) => CacheStatus::Miss,
            (Some(_), true) => CacheStatus::ExactHit,
            (Some(_), false) => CacheStatus::FallbackHit,
        }
    }

    /// Whether any candidate resolved
    #[must_use]
    pub const fn is_hit(&self) -> bool {
        self.resolved_key.is_some()
    }
}

/// Candidate keys in the order they are tried
///
/// Repeated keys are dropped. Keys that only differ in case or accents stay,
/// since they address different objects.
#[must_use]
pub fn candidates(primary: &CacheKey, restore_keys: &[CacheKey]) -> Vec<CacheKey> {
    let mut out = vec![primary.clone()];
    for key in restore_keys {
        if !out.contains(key) {
            out.push(key.clone());
        }
    }
    out
}

/// Resolves candidate keys against the object store
#[derive(Clone)]
pub struct KeyResolver {
    store: Arc<dyn ObjectStore>,
    retriever: Arc<Retriever>,
    bucket: String,
    prefix: Option<String>,
    concurrency: usize,
    retry: RetryConfig,
}

impl fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyResolver")
            .field("store", &self.store.provider_name())
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl KeyResolver {
    /// Create a resolver
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        retriever: Arc<Retriever>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        concurrency: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            retriever,
            bucket: bucket.into(),
            prefix,
            concurrency: concurrency.max(1),
            retry,
        }
    }

    /// Try each candidate until one restores every path
    ///
    /// With `lookup_only`, a candidate whose objects all exist resolves
    /// without anything being downloaded.
    #[instrument(
        name = "resolve",
        skip(self, primary, restore_keys, paths, cancel),
        fields(key = %primary, paths = paths.len())
    )]
    pub async fn resolve(
        &self,
        primary: &CacheKey,
        restore_keys: &[CacheKey],
        paths: &[PathBuf],
        lookup_only: bool,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome> {
        let mut state = ResolveState::Pending;

        for candidate in candidates(primary, restore_keys) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            debug!(from = ?state, key = %candidate, "Trying candidate key");
            state = ResolveState::Trying(candidate.clone());

            let storage_keys: Vec<(PathBuf, StorageKey)> = paths
                .iter()
                .map(|p| {
                    (
                        p.clone(),
                        StorageKey::derive(self.prefix.as_deref(), &candidate, p),
                    )
                })
                .collect();

            if !self.probe(&candidate, &storage_keys).await {
                continue;
            }

            let restored_paths = if lookup_only {
                BTreeSet::new()
            } else {
                let staged = match self.stage_all(&candidate, storage_keys, cancel).await {
                    Ok(staged) => staged,
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        warn!(
                            key = %candidate,
                            error = %e,
                            "Candidate could not be restored, trying the next key"
                        );
                        continue;
                    }
                };
                Self::commit_all(&candidate, staged).await?
            };

            let exact = keys_match(candidate.as_str(), primary.as_str());
            state = if exact {
                ResolveState::ExactHit(candidate.clone())
            } else {
                ResolveState::FallbackHit(candidate.clone())
            };
            info!(key = %candidate, exact, lookup_only, "Cache hit");
            debug!(state = ?state, "Resolution finished");

            return Ok(RestoreOutcome {
                resolved_key: Some(candidate),
                exact,
                restored_paths,
            });
        }

        state = ResolveState::Miss;
        info!(key = %primary, "Cache miss");
        debug!(state = ?state, "Resolution finished");
        Ok(RestoreOutcome::miss())
    }

    /// Check that every path has an object under `candidate`
    async fn probe(&self, candidate: &CacheKey, storage_keys: &[(PathBuf, StorageKey)]) -> bool {
        let probes = storage_keys.iter().map(|(path, storage_key)| async move {
            let key = storage_key.as_str();
            let result = retry_with_backoff(&self.retry, "head_object", || {
                self.store.head_object(&self.bucket, key)
            })
            .await;
            (path, storage_key, result)
        });

        let mut complete = true;
        for (path, storage_key, result) in futures::future::join_all(probes).await {
            match result {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(
                        key = %candidate,
                        path = %path.display(),
                        storage_key = %storage_key,
                        "No stored object for path"
                    );
                    complete = false;
                }
                Err(e) => {
                    warn!(
                        key = %candidate,
                        storage_key = %storage_key,
                        error = %e,
                        "Probe failed"
                    );
                    complete = false;
                }
            }
        }
        complete
    }

    /// Stage every path of one candidate, failing on the first error
    ///
    /// Nothing reaches the destinations here. On failure the remaining paths
    /// are skipped and every staging directory is removed before returning.
    async fn stage_all(
        &self,
        candidate: &CacheKey,
        storage_keys: Vec<(PathBuf, StorageKey)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StagedRestore>> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let abandoned = CancellationToken::new();
        let mut join_set = JoinSet::new();

        for (path, storage_key) in storage_keys {
            let retriever = Arc::clone(&self.retriever);
            let bucket = self.bucket.clone();
            let semaphore = Arc::clone(&semaphore);
            let abandoned = abandoned.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::configuration("restore semaphore closed"))?;
                if abandoned.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                retriever.stage(&bucket, &storage_key, &path).await
            });
        }

        let mut staged = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(Error::Cancelled);
                }
                next = join_set.join_next() => next,
            };
            let Some(joined) = next else {
                break;
            };
            let result = joined.map_err(|e| {
                Error::retrieval(candidate.as_str(), format!("restore task failed: {e}"))
            });
            match result.and_then(|r| r) {
                Ok(entry) => staged.push(entry),
                Err(e) => {
                    // Drain so every staging directory is gone before the next candidate
                    abandoned.cancel();
                    while join_set.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }
        Ok(staged)
    }

    /// Move every staged path of a complete candidate into place
    async fn commit_all(
        candidate: &CacheKey,
        staged: Vec<StagedRestore>,
    ) -> Result<BTreeSet<PathBuf>> {
        tokio::task::spawn_blocking(move || {
            staged
                .into_iter()
                .map(|entry| entry.commit().map(|artifact| artifact.path().to_path_buf()))
                .collect::<Result<BTreeSet<_>>>()
        })
        .await
        .map_err(|e| Error::retrieval(candidate.as_str(), format!("restore task failed: {e}")))?
    }
}
