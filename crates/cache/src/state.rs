//! State carried from the restore phase to the save phase

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Names of the values shared between phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateKey {
    /// Primary key the restore ran with
    PrimaryKey,
    /// Key the restore resolved to, if any
    MatchedKey,
}

impl StateKey {
    /// Stable name used in state files
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PrimaryKey => "CACHE_PRIMARY_KEY",
            Self::MatchedKey => "CACHE_MATCHED_KEY",
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Persists values between the restore and save phases of a job
pub trait StateProvider: Send + Sync {
    /// Record `value` under `key`
    fn set_state(&self, key: StateKey, value: &str) -> Result<()>;

    /// Read a value recorded by an earlier phase
    ///
    /// An empty value reads as absent.
    fn get_state(&self, key: StateKey) -> Result<Option<String>>;

    /// Forget the value under `key`
    ///
    /// Providers that cannot delete record an empty value instead.
    fn clear_state(&self, key: StateKey) -> Result<()> {
        self.set_state(key, "")
    }
}

/// State provider for standalone runs: nothing is kept
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStateProvider;

impl StateProvider for NullStateProvider {
    fn set_state(&self, _key: StateKey, _value: &str) -> Result<()> {
        Ok(())
    }

    fn get_state(&self, _key: StateKey) -> Result<Option<String>> {
        Ok(None)
    }
}

/// State kept as a JSON object in a local file
#[derive(Debug, Clone)]
pub struct FileStateProvider {
    path: PathBuf,
}

impl FileStateProvider {
    /// Use the state file at `path`; it is created on first write
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the state file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, state: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| Error::serialization(e.to_string()))?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }
        std::fs::write(&self.path, json).map_err(|e| Error::io(e, &self.path, "write"))
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::serialization(format!(
                    "invalid state file {}: {e}",
                    self.path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(Error::io(e, &self.path, "read")),
        }
    }
}

impl StateProvider for FileStateProvider {
    fn set_state(&self, key: StateKey, value: &str) -> Result<()> {
        let mut state = self.load()?;
        state.insert(key.name().to_string(), value.to_string());
        self.save(&state)
    }

    fn get_state(&self, key: StateKey) -> Result<Option<String>> {
        Ok(self.load()?.remove(key.name()).filter(|v| !v.is_empty()))
    }

    fn clear_state(&self, key: StateKey) -> Result<()> {
        let mut state = self.load()?;
        if state.remove(key.name()).is_some() {
            self.save(&state)?;
        }
        Ok(())
    }
}
