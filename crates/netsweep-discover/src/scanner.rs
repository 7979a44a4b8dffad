//! Nmap process wrapper.
//!
//! Executes nmap as a child process via `tokio::process::Command` and
//! parses the XML output into typed Rust structs. Children are killed when
//! the future is dropped, so a caller-side timeout never leaks a process.

use std::time::Instant;

use tokio::process::Command;

use crate::error::ProbeError;
use crate::nmap_xml::{self, NmapRun};

/// Wrapper around the nmap binary.
#[derive(Debug, Clone)]
pub struct NmapScanner {
    nmap_path: String,
}

impl NmapScanner {
    pub fn new(nmap_path: &str) -> Self {
        Self {
            nmap_path: nmap_path.to_string(),
        }
    }

    pub fn path(&self) -> &str {
        &self.nmap_path
    }

    /// Verify nmap is installed and accessible.
    pub async fn verify_installation(&self) -> Result<String, ProbeError> {
        let output = Command::new(&self.nmap_path)
            .arg("--version")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::from_spawn(&self.nmap_path, e))?;

        String::from_utf8(output.stdout).map_err(|e| ProbeError::Parse(e.to_string()))
    }

    /// Run nmap with `flags` against `target` and parse the XML report.
    ///
    /// Nmap is invoked with `-oX -` to write XML to stdout.
    pub async fn run(&self, flags: &[&str], target: &str) -> Result<NmapRun, ProbeError> {
        let start = Instant::now();

        tracing::debug!(target = %target, flags = ?flags, "Starting nmap");

        let output = Command::new(&self.nmap_path)
            .args(flags)
            .arg("-oX")
            .arg("-")
            .arg("--noninteractive")
            .arg(target)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::from_spawn(&self.nmap_path, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("requires root privileges") {
                return Err(ProbeError::InsufficientPrivilege(stderr));
            }
            return Err(ProbeError::ToolFailed {
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let nmap_run = nmap_xml::parse_nmap_xml(&output.stdout)?;

        tracing::debug!(
            target = %target,
            hosts = nmap_run.hosts.len(),
            hosts_up = ?nmap_run
                .runstats
                .as_ref()
                .and_then(|s| s.hosts.as_ref())
                .and_then(|h| h.up.as_deref()),
            duration_ms = start.elapsed().as_millis() as u64,
            "Nmap complete"
        );

        Ok(nmap_run)
    }
}
