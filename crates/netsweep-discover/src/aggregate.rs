//! Folds the unordered result stream of a sweep into reports.
//!
//! Aggregation runs on a single consumer after the scan phase; probers never
//! touch this state. Hosts are de-duplicated by address, so one host
//! observed twice still counts once towards a subnet's activity.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use netsweep_core::types::containing_subnet;
use netsweep_core::{CoreError, Finding, ScanResult, ScriptOutcome};
use serde::Serialize;

use crate::error::Result;
use crate::scheduler::UnitFailure;

// ── Report Types ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostEntry {
    pub addr: Ipv4Addr,
    pub hostname: Option<String>,
}

impl std::fmt::Display for HostEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.hostname {
            Some(name) => write!(f, "{name} ({})", self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

/// Live hosts grouped under their containing subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubnetActivity {
    pub subnet: Ipv4Net,
    pub hosts: Vec<HostEntry>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VlanFinding {
    pub host: Ipv4Addr,
    pub vlan_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumerationEntry {
    pub port: u16,
    pub script: String,
    pub outcome: ScriptOutcome,
}

/// Everything learned about the services of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostServiceRecord {
    pub host: Ipv4Addr,
    pub open_ports: BTreeSet<u16>,
    pub enumeration: Vec<EnumerationEntry>,
}

impl HostServiceRecord {
    fn new(host: Ipv4Addr) -> Self {
        Self {
            host,
            open_ports: BTreeSet::new(),
            enumeration: Vec::new(),
        }
    }
}

/// Deterministic view of a finished sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub granularity: u8,
    pub threshold: usize,
    /// Every subnet with at least one live host, ascending.
    pub subnets: Vec<SubnetActivity>,
    pub live_hosts: Vec<HostEntry>,
    pub vlans: Vec<VlanFinding>,
    pub services: Vec<HostServiceRecord>,
    pub failures: Vec<UnitFailure>,
}

impl SweepReport {
    /// Subnets meeting the activity threshold, ascending.
    pub fn active_subnets(&self) -> Vec<Ipv4Net> {
        self.active_memberships().map(|s| s.subnet).collect()
    }

    pub fn active_memberships(&self) -> impl Iterator<Item = &SubnetActivity> {
        self.subnets.iter().filter(|s| s.active)
    }
}

// ── Aggregator ────────────────────────────────────────────────────

pub struct ResultAggregator {
    granularity: u8,
    threshold: usize,
    subnets: BTreeMap<Ipv4Net, BTreeSet<Ipv4Addr>>,
    live: BTreeMap<Ipv4Addr, Option<String>>,
    vlans: BTreeSet<(Ipv4Addr, u16)>,
    services: BTreeMap<Ipv4Addr, HostServiceRecord>,
    failures: Vec<UnitFailure>,
}

impl ResultAggregator {
    /// `granularity` is the prefix length hosts are grouped at; a subnet is
    /// active once it holds `threshold` distinct live hosts.
    pub fn new(granularity: u8, threshold: usize) -> Result<Self> {
        if granularity > 32 {
            return Err(CoreError::PrefixOutOfRange {
                prefix: granularity,
                min: 0,
            }
            .into());
        }
        Ok(Self {
            granularity,
            threshold: threshold.max(1),
            subnets: BTreeMap::new(),
            live: BTreeMap::new(),
            vlans: BTreeSet::new(),
            services: BTreeMap::new(),
            failures: Vec::new(),
        })
    }

    pub fn ingest(&mut self, result: ScanResult) {
        match result.finding {
            Finding::Liveness {
                host,
                alive: true,
                hostname,
            } => {
                if let Ok(subnet) = containing_subnet(host, self.granularity) {
                    self.subnets.entry(subnet).or_default().insert(host);
                }
                let name = self.live.entry(host).or_default();
                if name.is_none() {
                    *name = hostname;
                }
            }
            Finding::Liveness { alive: false, .. } => {}
            Finding::PortState {
                host,
                port,
                open: true,
            } => {
                self.service_record(host).open_ports.insert(port);
            }
            Finding::PortState { open: false, .. } => {}
            Finding::VlanTag { host, vlan_id } => {
                self.vlans.insert((host, vlan_id));
            }
            Finding::Service {
                host,
                port,
                script,
                outcome,
            } => {
                let record = self.service_record(host);
                record.open_ports.insert(port);
                record.enumeration.push(EnumerationEntry {
                    port,
                    script,
                    outcome,
                });
            }
        }
    }

    pub fn ingest_all(&mut self, results: impl IntoIterator<Item = ScanResult>) {
        for result in results {
            self.ingest(result);
        }
    }

    pub fn record_failures(&mut self, failures: impl IntoIterator<Item = UnitFailure>) {
        self.failures.extend(failures);
    }

    pub fn finish(self) -> SweepReport {
        let live = self.live;
        let entry = |addr: &Ipv4Addr| HostEntry {
            addr: *addr,
            hostname: live.get(addr).cloned().flatten(),
        };

        let subnets = self
            .subnets
            .iter()
            .map(|(subnet, hosts)| SubnetActivity {
                subnet: *subnet,
                hosts: hosts.iter().map(entry).collect(),
                active: hosts.len() >= self.threshold,
            })
            .collect();

        let live_hosts = live.keys().map(entry).collect();

        let vlans = self
            .vlans
            .into_iter()
            .map(|(host, vlan_id)| VlanFinding { host, vlan_id })
            .collect();

        let services = self
            .services
            .into_values()
            .map(|mut record| {
                // Stable, so repeated runs of one script keep arrival order.
                record
                    .enumeration
                    .sort_by(|a, b| (a.port, &a.script).cmp(&(b.port, &b.script)));
                record
            })
            .collect();

        let mut failures = self.failures;
        failures.sort_by(|a, b| a.unit.cmp(&b.unit).then_with(|| a.detail.cmp(&b.detail)));

        SweepReport {
            granularity: self.granularity,
            threshold: self.threshold,
            subnets,
            live_hosts,
            vlans,
            services,
            failures,
        }
    }

    fn service_record(&mut self, host: Ipv4Addr) -> &mut HostServiceRecord {
        self.services
            .entry(host)
            .or_insert_with(|| HostServiceRecord::new(host))
    }
}
