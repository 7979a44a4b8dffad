//! Text and JSON report sinks.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use netsweep_core::{ScanUnit, ScriptOutcome};
use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::SweepReport;
use crate::config::SweepMode;
use crate::error::{DiscoverError, Result};
use crate::scheduler::{SweepOutcome, SweepStats};

// ── Rendering ─────────────────────────────────────────────────────

/// Active subnets, one CIDR per line.
pub fn render_active_subnets(report: &SweepReport) -> String {
    let mut out = String::new();
    for subnet in report.active_subnets() {
        let _ = writeln!(out, "{subnet}");
    }
    out
}

/// `Subnet: <cidr>` followed by its indented hosts, for active subnets only.
pub fn render_memberships(report: &SweepReport) -> String {
    let mut out = String::new();
    for activity in report.active_memberships() {
        let _ = writeln!(out, "Subnet: {}", activity.subnet);
        for host in &activity.hosts {
            let _ = writeln!(out, "  {host}");
        }
        out.push('\n');
    }
    out
}

pub fn render_live_hosts(report: &SweepReport) -> String {
    let mut out = String::new();
    for host in &report.live_hosts {
        let _ = writeln!(out, "{}", host.addr);
    }
    out
}

/// `<host> - VLAN ID: <n>` lines.
pub fn render_vlans(report: &SweepReport) -> String {
    let mut out = String::new();
    for finding in &report.vlans {
        let _ = writeln!(out, "{} - VLAN ID: {}", finding.host, finding.vlan_id);
    }
    out
}

pub fn render_services(report: &SweepReport) -> String {
    let mut out = String::new();
    for record in &report.services {
        let _ = writeln!(out, "Host: {}", record.host);
        let ports: Vec<String> = record.open_ports.iter().map(u16::to_string).collect();
        let _ = writeln!(out, "  Open ports: {}", ports.join(", "));

        for entry in &record.enumeration {
            match &entry.outcome {
                ScriptOutcome::Output(text) => {
                    let _ = writeln!(out, "  [{}] {}:", entry.port, entry.script);
                    for line in text.lines() {
                        let _ = writeln!(out, "    {line}");
                    }
                }
                ScriptOutcome::NoOutput => {
                    let _ = writeln!(out, "  [{}] {}: no output", entry.port, entry.script);
                }
                ScriptOutcome::Failed(reason) => {
                    let _ = writeln!(
                        out,
                        "  [{}] {}: FAILED ({reason})",
                        entry.port, entry.script
                    );
                }
            }
        }
        out.push('\n');
    }
    out
}

// ── Sinks ─────────────────────────────────────────────────────────

/// Full machine-readable record of one sweep.
#[derive(Debug, Serialize)]
pub struct JsonReport<'a> {
    pub sweep_id: Uuid,
    pub mode: SweepMode,
    pub generated_at: DateTime<Utc>,
    pub resumed_from: Option<ScanUnit>,
    pub checkpoint: Option<ScanUnit>,
    pub persistence_degraded: bool,
    pub stats: &'a SweepStats,
    pub report: &'a SweepReport,
}

impl<'a> JsonReport<'a> {
    pub fn new(mode: SweepMode, outcome: &'a SweepOutcome, report: &'a SweepReport) -> Self {
        Self {
            sweep_id: outcome.sweep_id,
            mode,
            generated_at: Utc::now(),
            resumed_from: outcome.resumed_from,
            checkpoint: outcome.checkpoint,
            persistence_degraded: outcome.persistence_degraded(),
            stats: &outcome.stats,
            report,
        }
    }
}

/// Where each report goes. Unset paths are skipped.
#[derive(Debug, Clone, Default)]
pub struct ReportWriter {
    pub active_subnets: Option<PathBuf>,
    pub memberships: Option<PathBuf>,
    pub live_hosts: Option<PathBuf>,
    pub vlans: Option<PathBuf>,
    pub services: Option<PathBuf>,
    pub json: Option<PathBuf>,
}

impl ReportWriter {
    /// Write every configured report and return the paths written.
    pub fn write(&self, report: &SweepReport, json: &JsonReport<'_>) -> Result<Vec<PathBuf>> {
        let text_reports: [(&Option<PathBuf>, fn(&SweepReport) -> String); 5] = [
            (&self.active_subnets, render_active_subnets),
            (&self.memberships, render_memberships),
            (&self.live_hosts, render_live_hosts),
            (&self.vlans, render_vlans),
            (&self.services, render_services),
        ];

        let mut written = Vec::new();
        for (path, render) in text_reports {
            if let Some(path) = path {
                write_text(path, &render(report))?;
                written.push(path.clone());
            }
        }

        if let Some(path) = &self.json {
            write_json(path, json)?;
            written.push(path.clone());
        }

        for path in &written {
            tracing::info!(path = %path.display(), "Report written");
        }
        Ok(written)
    }
}

pub fn write_text(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|source| DiscoverError::Persistence {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_json(path: &Path, report: &JsonReport<'_>) -> Result<()> {
    let body = serde_json::to_string_pretty(report)?;
    write_text(path, &body)
}
