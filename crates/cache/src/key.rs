//! Cache keys and the storage keys derived from them

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Component, Path};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Longest key accepted, in characters
pub const MAX_KEY_LENGTH: usize = 512;

/// Caller-supplied logical version identifier for a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a key after validating it
    ///
    /// Keys must be non-empty, at most [`MAX_KEY_LENGTH`] characters and
    /// free of commas.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        validate_key(&key)?;
        Ok(Self(key))
    }

    /// The key as given by the caller
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case- and accent-insensitive comparison used for exact-hit decisions
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        keys_match(&self.0, &other.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::validation("Cache key must not be empty"));
    }
    let length = key.chars().count();
    if length > MAX_KEY_LENGTH {
        return Err(Error::validation(format!(
            "Cache key is {length} characters long, the maximum is {MAX_KEY_LENGTH}"
        )));
    }
    if key.contains(',') {
        return Err(Error::validation(format!(
            "Cache key must not contain commas: {key}"
        )));
    }
    Ok(())
}

/// Fold a key for comparison: decompose, drop combining marks, lowercase
#[must_use]
pub fn fold_key(key: &str) -> String {
    key.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Compare two keys ignoring case and accents
///
/// `"Build-Ä"` and `"build-a"` are the same key under this rule.
#[must_use]
pub fn keys_match(a: &str, b: &str) -> bool {
    fold_key(a) == fold_key(b)
}

/// Object-store identifier for one (cache key, local path) pair
///
/// Layout: `{prefix/}{key}/{digest16}-{basename}`. The last `/`-separated
/// component is derived from the path alone and never contains `/`, so two
/// different pairs never share a storage key under the same prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(String);

impl StorageKey {
    /// Derive the storage key for `path` saved under `key`
    #[must_use]
    pub fn derive(prefix: Option<&str>, key: &CacheKey, path: &Path) -> Self {
        let normalized = normalize_path(path);
        let digest = Sha256::digest(normalized.as_bytes());
        let short = hex::encode(&digest[..8]);
        let basename = path_basename(path);

        let object = format!("{}/{short}-{basename}", key.as_str());
        match prefix.map(|p| p.trim_matches('/')) {
            Some(p) if !p.is_empty() => Self(format!("{p}/{object}")),
            _ => Self(object),
        }
    }

    /// The storage key string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a caller path into a stable `/`-separated string
///
/// `.` components and trailing separators are dropped; `..` and root
/// components are kept so distinct locations stay distinct.
fn normalize_path(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut absolute = false;
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => {
                parts.push(prefix.as_os_str().to_string_lossy().replace('\\', "/"));
            }
            Component::RootDir => absolute = true,
            Component::CurDir => {}
            Component::ParentDir => parts.push("..".to_string()),
            Component::Normal(name) => parts.push(name.to_string_lossy().into_owned()),
        }
    }
    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

fn path_basename(path: &Path) -> String {
    path.components()
        .rev()
        .find_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().replace('/', "_")),
            _ => None,
        })
        .unwrap_or_else(|| "root".to_string())
}
