//! Append-only log of per-unit findings, kept beside the checkpoint.
//!
//! The checkpoint alone only says where to restart. The journal holds what
//! the units before it found, so a resumed sweep reports the whole range
//! rather than just the part scanned after the restart.
//!
//! One JSON object per line. Negative observations (dead hosts, closed
//! ports) are not written; they never reach a report.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use netsweep_core::{ScanResult, ScanUnit};
use serde::{Deserialize, Serialize};

use crate::error::{DiscoverError, Result};
use crate::scheduler::UnitFailure;

/// Everything one finished unit contributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub unit: ScanUnit,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ScanResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<UnitFailure>,
}

impl JournalRecord {
    /// Nothing worth persisting.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.failure.is_none()
    }
}

pub struct ResultJournal {
    path: PathBuf,
    file: Option<File>,
}

impl ResultJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Prepare the journal for a sweep starting at `marker`.
    ///
    /// Records for units strictly before `marker` are kept and returned for
    /// replay. Everything else is discarded, since those units are about to
    /// be scanned again. `None` starts an empty journal. Unparsable lines,
    /// such as one torn by a crash mid-write, are skipped.
    pub fn resume(&mut self, marker: Option<&ScanUnit>) -> Result<Vec<JournalRecord>> {
        self.file = None;

        let kept = match marker {
            Some(marker) => self
                .read_all()?
                .into_iter()
                .filter(|r| r.unit < *marker)
                .collect(),
            None => Vec::new(),
        };

        self.rewrite(&kept)?;
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| self.persistence_error(e))?;
        self.file = Some(file);

        tracing::debug!(
            path = %self.path.display(),
            replayed = kept.len(),
            "Result journal ready"
        );
        Ok(kept)
    }

    /// Append one record and flush it to disk.
    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let Some(file) = self.file.as_mut() else {
            return Err(DiscoverError::Setup(
                "result journal appended before resume".to_string(),
            ));
        };
        let written = file.write_all(&line).and_then(|()| file.sync_data());
        written.map_err(|e| self.persistence_error(e))
    }

    fn read_all(&self) -> Result<Vec<JournalRecord>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.persistence_error(e)),
        };

        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.persistence_error(e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    error = %e,
                    "Skipping malformed journal line"
                ),
            }
        }
        Ok(records)
    }

    fn rewrite(&self, records: &[JournalRecord]) -> Result<()> {
        let tmp = temp_path(&self.path);
        let write = || -> std::io::Result<()> {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for record in records {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.into_inner()?.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| self.persistence_error(e))
    }

    fn persistence_error(&self, source: std::io::Error) -> DiscoverError {
        DiscoverError::Persistence {
            path: self.path.clone(),
            source,
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
