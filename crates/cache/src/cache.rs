//! Save and restore orchestration over a set of paths

use crate::archive;
use crate::config::TransferConfig;
use crate::key::{CacheKey, StorageKey};
use crate::resolver::{KeyResolver, RestoreOutcome};
use crate::retrieve::Retriever;
use crate::store::ObjectStore;
use crate::transport::{Transport, UploadStrategy};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Per-path result of a save
#[derive(Debug, Default)]
pub struct SaveReport {
    /// Paths stored under the key
    pub succeeded: BTreeSet<PathBuf>,
    /// Paths that could not be stored, with the cause
    pub failed: BTreeMap<PathBuf, Error>,
}

impl SaveReport {
    /// Every path was stored
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// No path was stored
    #[must_use]
    pub fn is_total_failure(&self) -> bool {
        self.succeeded.is_empty() && !self.failed.is_empty()
    }
}

/// Parameters of one restore
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Key tried first
    pub primary_key: CacheKey,
    /// Fallback keys, in order of preference
    pub restore_keys: Vec<CacheKey>,
    /// Paths to restore
    pub paths: Vec<PathBuf>,
    /// Fail with `Error::CacheMiss` when nothing resolves
    pub fail_on_miss: bool,
    /// Only check that an entry exists
    pub lookup_only: bool,
}

impl RestoreRequest {
    /// Request restoring `paths` from `primary_key` alone
    #[must_use]
    pub fn new(primary_key: CacheKey, paths: Vec<PathBuf>) -> Self {
        Self {
            primary_key,
            restore_keys: Vec::new(),
            paths,
            fail_on_miss: false,
            lookup_only: false,
        }
    }

    /// Add fallback keys
    #[must_use]
    pub fn with_restore_keys(mut self, restore_keys: Vec<CacheKey>) -> Self {
        self.restore_keys = restore_keys;
        self
    }

    /// Fail when nothing resolves
    #[must_use]
    pub const fn fail_on_miss(mut self, fail: bool) -> Self {
        self.fail_on_miss = fail;
        self
    }

    /// Resolve without downloading
    #[must_use]
    pub const fn lookup_only(mut self, lookup_only: bool) -> Self {
        self.lookup_only = lookup_only;
        self
    }
}

/// Cache of filesystem artifacts in one bucket
pub struct Stash {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: Option<String>,
    config: TransferConfig,
    transport: Transport,
    retriever: Arc<Retriever>,
}

impl std::fmt::Debug for Stash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stash")
            .field("store", &self.store.provider_name())
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Stash {
    /// Create a cache over `store`
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        config: TransferConfig,
    ) -> Result<Self> {
        let bucket = bucket.into();
        if bucket.trim().is_empty() {
            return Err(Error::configuration("Bucket name must not be empty"));
        }
        let prefix = prefix.filter(|p| !p.trim_matches('/').is_empty());
        let transport = Transport::new(Arc::clone(&store), &config);
        let retriever = Arc::new(Retriever::new(Arc::clone(&store), &config));
        Ok(Self {
            store,
            bucket,
            prefix,
            config,
            transport,
            retriever,
        })
    }

    /// Bucket the cache lives in
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Transfer settings
    #[must_use]
    pub const fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Storage key of `path` under `key`
    #[must_use]
    pub fn storage_key(&self, key: &CacheKey, path: &Path) -> StorageKey {
        StorageKey::derive(self.prefix.as_deref(), key, path)
    }

    /// Store every path under `key`
    ///
    /// A path that fails is recorded in the report and the others continue.
    /// Only cancellation and invalid input fail the whole call.
    #[instrument(name = "save", skip(self, key, paths, cancel), fields(key = %key))]
    pub async fn save(
        &self,
        key: &CacheKey,
        paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<SaveReport> {
        let paths: BTreeSet<PathBuf> = paths.iter().cloned().collect();
        if paths.is_empty() {
            return Err(Error::validation("At least one path is required"));
        }

        let semaphore = Arc::new(Semaphore::new(self.config.effective_concurrency()));
        let mut join_set = JoinSet::new();
        let mut task_paths: HashMap<task::Id, PathBuf> = HashMap::new();

        for path in paths {
            let ctx = SaveTask {
                transport: self.transport.clone(),
                bucket: self.bucket.clone(),
                storage_key: self.storage_key(key, &path),
                temp_dir: self.config.effective_temp_dir(),
                level: self.config.compression_level,
                cancel: cancel.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            let task_path = path.clone();
            let handle = join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => ctx.run(&path).await,
                    Err(_) => Err(Error::Cancelled),
                };
                (path, result)
            });
            task_paths.insert(handle.id(), task_path);
        }

        let mut report = SaveReport::default();
        while let Some(joined) = join_set.join_next().await {
            let (path, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    let Some(path) = task_paths.remove(&e.id()) else {
                        warn!(error = %e, "Save task failed for an unknown path");
                        continue;
                    };
                    let err = Error::io(e.into(), &path, "save task");
                    (path, Err(err))
                }
            };
            match result {
                Ok(strategy) => {
                    info!(path = %path.display(), strategy = ?strategy, "Saved path");
                    report.succeeded.insert(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to save path");
                    report.failed.insert(path, e);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        info!(
            saved = report.succeeded.len(),
            failed = report.failed.len(),
            "Save finished"
        );
        Ok(report)
    }

    /// Restore the request's paths from the best available key
    #[instrument(
        name = "restore",
        skip(self, request, cancel),
        fields(key = %request.primary_key, lookup_only = request.lookup_only)
    )]
    pub async fn restore(
        &self,
        request: &RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome> {
        if request.paths.is_empty() {
            return Err(Error::validation("At least one path is required"));
        }
        let paths: Vec<PathBuf> = request
            .paths
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let resolver = KeyResolver::new(
            Arc::clone(&self.store),
            Arc::clone(&self.retriever),
            self.bucket.clone(),
            self.prefix.clone(),
            self.config.effective_concurrency(),
            self.config.retry.clone(),
        );
        let outcome = resolver
            .resolve(
                &request.primary_key,
                &request.restore_keys,
                &paths,
                request.lookup_only,
                cancel,
            )
            .await?;

        if !outcome.is_hit() && request.fail_on_miss {
            return Err(Error::CacheMiss {
                key: request.primary_key.to_string(),
                fallbacks: request
                    .restore_keys
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            });
        }
        Ok(outcome)
    }
}

/// Everything one path needs to be packed and uploaded off the caller's task
struct SaveTask {
    transport: Transport,
    bucket: String,
    storage_key: StorageKey,
    temp_dir: PathBuf,
    level: i32,
    cancel: CancellationToken,
}

impl SaveTask {
    async fn run(self, path: &Path) -> Result<UploadStrategy> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let src = path.to_path_buf();
        let temp_dir = self.temp_dir.clone();
        let level = self.level;
        let payload = tokio::task::spawn_blocking(move || archive::pack(&src, &temp_dir, level))
            .await
            .map_err(|e| Error::io_no_path(std::io::Error::other(e), "archive task"))??;

        self.transport
            .upload(&self.bucket, &self.storage_key, &payload, &self.cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::resolver::CacheStatus;
    use tempfile::TempDir;

    fn stash(store: Arc<MemoryStore>, temp: &TempDir) -> Stash {
        let config = TransferConfig {
            temp_dir: Some(temp.path().join("tmp")),
            retry: crate::config::RetryConfig::no_retry(),
            ..TransferConfig::default()
        };
        Stash::new(store, "bucket", Some("ci".to_string()), config).unwrap()
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s).unwrap()
    }

    #[test]
    fn test_empty_bucket_is_configuration_error() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let err = Stash::new(store, " ", None, TransferConfig::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_report_classification() {
        let mut report = SaveReport::default();
        assert!(report.is_success());
        assert!(!report.is_total_failure());

        report
            .failed
            .insert(PathBuf::from("a"), Error::path_not_found("a"));
        assert!(!report.is_success());
        assert!(report.is_total_failure());

        report.succeeded.insert(PathBuf::from("b"));
        assert!(!report.is_total_failure());
    }

    #[tokio::test]
    async fn test_save_uses_prefixed_storage_keys() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let stash = stash(store.clone(), &temp);
        let file = temp.path().join("lock.txt");
        std::fs::write(&file, "deps").unwrap();

        let report = stash
            .save(&key("v1"), &[file.clone()], &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_success());
        let keys = store.object_keys("bucket");
        assert_eq!(keys, vec![stash.storage_key(&key("v1"), &file).to_string()]);
        assert!(keys[0].starts_with("ci/v1/"));
    }

    #[tokio::test]
    async fn test_save_without_paths_is_rejected() {
        let temp = TempDir::new().unwrap();
        let stash = stash(Arc::new(MemoryStore::new()), &temp);
        let err = stash
            .save(&key("v1"), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_restore_miss_with_fail_on_miss() {
        let temp = TempDir::new().unwrap();
        let stash = stash(Arc::new(MemoryStore::new()), &temp);
        let request = RestoreRequest::new(key("v2"), vec![temp.path().join("dist")])
            .with_restore_keys(vec![key("v1")])
            .fail_on_miss(true);

        let err = stash
            .restore(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheMiss { ref fallbacks, .. } if fallbacks == &["v1"]));
    }

    #[tokio::test]
    async fn test_restore_miss_without_fail_on_miss() {
        let temp = TempDir::new().unwrap();
        let stash = stash(Arc::new(MemoryStore::new()), &temp);
        let request = RestoreRequest::new(key("v2"), vec![temp.path().join("dist")]);

        let outcome = stash
            .restore(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status(), CacheStatus::Miss);
    }
}
