//! Snapshot-style access to the host configuration.
//!
//! Readers always get an immutable `Arc<SwitchboardConfig>`; writers go
//! through [`ConfigSource::update`], which swaps in a new snapshot. A snapshot
//! handed out earlier is never modified.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use tracing::debug;

use crate::{
    loader::{load_config, load_config_raw, save_config},
    schema::SwitchboardConfig,
};

/// Where channel adapters read configuration from and write credential or
/// allowlist changes back to.
pub trait ConfigSource: Send + Sync {
    /// Current configuration snapshot.
    fn snapshot(&self) -> Arc<SwitchboardConfig>;

    /// Apply `edit` to a copy of the current configuration and publish it.
    fn update(&self, edit: &mut dyn FnMut(&mut SwitchboardConfig)) -> anyhow::Result<()>;
}

/// In-memory configuration, used by tests and embedded hosts.
#[derive(Debug, Default)]
pub struct MemoryConfig {
    current: RwLock<Arc<SwitchboardConfig>>,
}

impl MemoryConfig {
    pub fn new(config: SwitchboardConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }
}

impl ConfigSource for MemoryConfig {
    fn snapshot(&self) -> Arc<SwitchboardConfig> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn update(&self, edit: &mut dyn FnMut(&mut SwitchboardConfig)) -> anyhow::Result<()> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = SwitchboardConfig::clone(&current);
        edit(&mut next);
        *current = Arc::new(next);
        Ok(())
    }
}

/// File-backed configuration. Updates re-read the file, apply the edit and
/// write it back so concurrent manual edits are not clobbered by a stale
/// cache.
///
/// The edit runs against the file as written, before `${ENV_VAR}`
/// substitution, so placeholders are written back verbatim and resolved
/// secrets never reach the disk.
#[derive(Debug)]
pub struct FileConfig {
    path: PathBuf,
    current: RwLock<Arc<SwitchboardConfig>>,
}

impl FileConfig {
    /// Load `path` now; fails if the file cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let config = load_config(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file and publish the result.
    pub fn reload(&self) -> anyhow::Result<()> {
        let config = load_config(&self.path)?;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
        debug!(path = %self.path.display(), "reloaded config");
        Ok(())
    }
}

impl ConfigSource for FileConfig {
    fn snapshot(&self) -> Arc<SwitchboardConfig> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn update(&self, edit: &mut dyn FnMut(&mut SwitchboardConfig)) -> anyhow::Result<()> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if !self.path.exists() {
            let mut next = SwitchboardConfig::clone(&current);
            edit(&mut next);
            save_config(&next, &self.path)?;
            *current = Arc::new(next);
            return Ok(());
        }
        let mut document = load_config_raw(&self.path)?;
        edit(&mut document);
        save_config(&document, &self.path)?;
        *current = Arc::new(load_config(&self.path)?);
        Ok(())
    }
}
