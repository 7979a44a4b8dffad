//! Checkpoint persistence for resumable sweeps.
//!
//! The marker is a single [`ScanUnit`] in its canonical text form. It is
//! read once when a sweep starts and overwritten as the sweep advances.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use netsweep_core::ScanUnit;

use crate::error::{DiscoverError, Result};

/// Storage backend for the sweep checkpoint.
pub trait ProgressStore: Send {
    /// Read the stored marker. Absent, empty, or unparsable markers are `None`.
    fn load(&self) -> Result<Option<ScanUnit>>;

    /// Replace the stored marker.
    fn save(&mut self, marker: &ScanUnit) -> Result<()>;
}

/// Marker kept in a single text file.
///
/// Writes go to a sibling temp file that is synced and renamed over the
/// target, so a crash leaves either the old or the new marker.
pub struct FileProgressStore {
    path: PathBuf,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn persistence_error(&self, source: std::io::Error) -> DiscoverError {
        DiscoverError::Persistence {
            path: self.path.clone(),
            source,
        }
    }
}

impl ProgressStore for FileProgressStore {
    fn load(&self) -> Result<Option<ScanUnit>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.persistence_error(e)),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        match trimmed.parse::<ScanUnit>() {
            Ok(unit) => Ok(Some(unit)),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Ignoring malformed progress marker"
                );
                Ok(None)
            }
        }
    }

    fn save(&mut self, marker: &ScanUnit) -> Result<()> {
        let tmp = self.temp_path();
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(marker.to_string().as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| self.persistence_error(e))?;

        tracing::debug!(marker = %marker, path = %self.path.display(), "Checkpoint saved");
        Ok(())
    }
}

/// In-memory store, shareable so the writer and an observer can both see it.
#[derive(Debug, Clone, Default)]
pub struct MemoryProgressStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    marker: Option<ScanUnit>,
    history: Vec<ScanUnit>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `marker`, as if a previous run stopped there.
    pub fn with_marker(marker: ScanUnit) -> Self {
        let store = Self::default();
        if let Ok(mut state) = store.inner.lock() {
            state.marker = Some(marker);
        }
        store
    }

    pub fn marker(&self) -> Option<ScanUnit> {
        self.inner.lock().ok().and_then(|s| s.marker)
    }

    /// Every marker written, in write order.
    pub fn history(&self) -> Vec<ScanUnit> {
        self.inner
            .lock()
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn load(&self) -> Result<Option<ScanUnit>> {
        Ok(self.marker())
    }

    fn save(&mut self, marker: &ScanUnit) -> Result<()> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| DiscoverError::Setup("progress store lock poisoned".to_string()))?;
        state.marker = Some(*marker);
        state.history.push(*marker);
        Ok(())
    }
}
