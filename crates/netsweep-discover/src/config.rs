//! Configuration for the netsweep engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoverError, Result};

/// Upper bound on any worker pool.
pub const MAX_WORKERS: usize = 4096;

/// Top-level sweep configuration.
///
/// Loaded from `netsweep.toml` `[sweep]` section or
/// `NETSWEEP__` environment variables. CLI flags override both.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    /// Path to the nmap binary (default: "nmap").
    #[serde(default = "default_nmap_path")]
    pub nmap_path: String,

    /// Path to the ping binary (default: "ping").
    #[serde(default = "default_ping_path")]
    pub ping_path: String,

    /// Seconds a single unit may run before it is abandoned.
    #[serde(default = "default_unit_timeout")]
    pub unit_timeout_secs: u64,

    /// Granularity used for subnet units and subnet grouping.
    #[serde(default = "default_subnet_prefix")]
    pub subnet_prefix: u8,

    /// Minimum distinct live hosts for a subnet to count as active.
    #[serde(default = "default_activity_threshold")]
    pub activity_threshold: usize,

    /// Worker pool sizes per sweep mode.
    #[serde(default)]
    pub workers: WorkerDefaults,

    /// Ports enumerated with SMB scripts once found open.
    #[serde(default = "default_smb_ports")]
    pub smb_ports: Vec<u16>,

    /// Nmap NSE scripts run against each open SMB port.
    #[serde(default = "default_smb_scripts")]
    pub smb_scripts: Vec<String>,

    #[serde(default)]
    pub vlan: VlanConfig,
}

/// Which workflow a sweep runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepMode {
    /// Ping-sweep subnet units and report active subnets.
    Subnets,
    /// Ping single hosts and probe live ones for VLAN tags.
    Hosts,
    /// Port-check hosts and run SMB enumeration scripts.
    Services,
}

impl std::fmt::Display for SweepMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subnets => write!(f, "subnets"),
            Self::Hosts => write!(f, "hosts"),
            Self::Services => write!(f, "services"),
        }
    }
}

/// Worker pool sizes. Liveness checks are light and tolerate a wide pool;
/// enumeration runs heavier nmap scripts and stays narrow.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerDefaults {
    #[serde(default = "default_subnet_workers")]
    pub subnets: usize,
    #[serde(default = "default_host_workers")]
    pub hosts: usize,
    #[serde(default = "default_service_workers")]
    pub services: usize,
}

impl WorkerDefaults {
    pub fn for_mode(&self, mode: SweepMode) -> usize {
        match mode {
            SweepMode::Subnets => self.subnets,
            SweepMode::Hosts => self.hosts,
            SweepMode::Services => self.services,
        }
    }
}

/// 802.1Q probing settings for host sweeps.
#[derive(Debug, Clone, Deserialize)]
pub struct VlanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interface to send tagged frames on. First usable interface when unset.
    #[serde(default)]
    pub interface: Option<String>,

    /// VLAN ID placed in the outgoing tag.
    #[serde(default = "default_probe_vlan")]
    pub probe_vlan_id: u16,

    /// How long to wait for a tagged reply.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

impl SweepConfig {
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    /// Reject settings that would make a sweep meaningless before it starts.
    pub fn validate(&self) -> Result<()> {
        if self.unit_timeout_secs == 0 {
            return Err(DiscoverError::Setup(
                "unit timeout must be at least one second".to_string(),
            ));
        }
        if self.subnet_prefix > 32 {
            return Err(DiscoverError::Setup(format!(
                "subnet prefix /{} is not a valid IPv4 prefix",
                self.subnet_prefix
            )));
        }
        if self.activity_threshold == 0 {
            return Err(DiscoverError::Setup(
                "activity threshold must be at least 1".to_string(),
            ));
        }
        for (mode, workers) in [
            (SweepMode::Subnets, self.workers.subnets),
            (SweepMode::Hosts, self.workers.hosts),
            (SweepMode::Services, self.workers.services),
        ] {
            if workers == 0 || workers > MAX_WORKERS {
                return Err(DiscoverError::Setup(format!(
                    "worker count for {mode} sweeps must be within 1..={MAX_WORKERS}, got {workers}"
                )));
            }
        }
        if self.vlan.probe_vlan_id == 0 || self.vlan.probe_vlan_id > 4094 {
            return Err(DiscoverError::Setup(format!(
                "probe VLAN ID {} is outside 1..=4094",
                self.vlan.probe_vlan_id
            )));
        }
        Ok(())
    }
}

fn default_nmap_path() -> String {
    "nmap".to_string()
}

fn default_ping_path() -> String {
    "ping".to_string()
}

fn default_unit_timeout() -> u64 {
    60
}

fn default_subnet_prefix() -> u8 {
    24
}

fn default_activity_threshold() -> usize {
    2
}

fn default_subnet_workers() -> usize {
    10
}

fn default_host_workers() -> usize {
    100
}

fn default_service_workers() -> usize {
    5
}

fn default_smb_ports() -> Vec<u16> {
    vec![139, 445]
}

fn default_smb_scripts() -> Vec<String> {
    [
        "smb-enum-shares",
        "smb-enum-users",
        "smb-enum-sessions",
        "smb-os-discovery",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_probe_vlan() -> u16 {
    1
}

fn default_reply_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self {
            subnets: default_subnet_workers(),
            hosts: default_host_workers(),
            services: default_service_workers(),
        }
    }
}

impl Default for VlanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: None,
            probe_vlan_id: default_probe_vlan(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            nmap_path: default_nmap_path(),
            ping_path: default_ping_path(),
            unit_timeout_secs: default_unit_timeout(),
            subnet_prefix: default_subnet_prefix(),
            activity_threshold: default_activity_threshold(),
            workers: WorkerDefaults::default(),
            smb_ports: default_smb_ports(),
            smb_scripts: default_smb_scripts(),
            vlan: VlanConfig::default(),
        }
    }
}

/// Load `[sweep]` from `<file_prefix>.toml` and `NETSWEEP__*` variables.
///
/// A missing file or section falls back to defaults; a present but
/// malformed section is an error.
pub fn load(file_prefix: &str) -> Result<SweepConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("NETSWEEP")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    match cfg.get::<SweepConfig>("sweep") {
        Ok(c) => Ok(c),
        Err(config::ConfigError::NotFound(_)) => Ok(SweepConfig::default()),
        Err(e) => Err(e.into()),
    }
}
