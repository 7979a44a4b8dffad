//! Explicit target lists for host-oriented sweeps.

use std::path::Path;

use netsweep_core::types::parse_range;
use netsweep_core::ScanUnit;

use crate::error::{DiscoverError, Result};
use crate::partition::UnitSource;

/// A sorted, de-duplicated list of host units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetList {
    hosts: Vec<ScanUnit>,
}

impl TargetList {
    /// Parse one target per line. Blank lines and `#` comments are ignored;
    /// CIDR entries expand to their usable host addresses.
    pub fn parse(input: &str) -> Result<Self> {
        let mut hosts = Vec::new();
        for (line_no, line) in input.lines().enumerate() {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            let net = parse_range(entry).map_err(|e| {
                DiscoverError::Setup(format!("target list line {}: {e}", line_no + 1))
            })?;
            if net.prefix_len() == 32 {
                hosts.push(ScanUnit::Host(net.addr()));
            } else {
                hosts.extend(net.hosts().map(ScanUnit::Host));
            }
        }
        hosts.sort();
        hosts.dedup();
        Ok(Self { hosts })
    }

    /// Read and parse a target file. An unreadable file is a setup failure.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DiscoverError::Setup(format!("cannot read target list {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> &[ScanUnit] {
        &self.hosts
    }
}

impl UnitSource for TargetList {
    type Iter = std::vec::IntoIter<ScanUnit>;

    fn resume_from(&self, marker: Option<&ScanUnit>) -> Self::Iter {
        let start = marker.map_or(0, |m| self.hosts.partition_point(|u| u < m));
        self.hosts[start..].to_vec().into_iter()
    }

    fn last(&self) -> Option<ScanUnit> {
        self.hosts.last().copied()
    }
}
