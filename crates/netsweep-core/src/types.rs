//! Core domain types for a network sweep.
//!
//! A sweep is a sequence of [`ScanUnit`]s, each probed once, producing
//! [`ScanResult`]s that downstream aggregation turns into reports.

use std::cmp::Ordering;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

// ── Address Ranges ────────────────────────────────────────────────

/// RFC 1918 private blocks, in ascending order.
pub const PRIVATE_RANGES: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// Parse a CIDR range, clearing host bits. A bare address is treated as `/32`.
pub fn parse_range(input: &str) -> Result<Ipv4Net> {
    let trimmed = input.trim();
    let net = if trimmed.contains('/') {
        trimmed
            .parse::<Ipv4Net>()
            .map_err(|e| CoreError::InvalidRange {
                input: trimmed.to_string(),
                reason: e.to_string(),
            })?
    } else {
        let addr = trimmed
            .parse::<Ipv4Addr>()
            .map_err(|e| CoreError::InvalidRange {
                input: trimmed.to_string(),
                reason: e.to_string(),
            })?;
        Ipv4Net::from(addr)
    };
    Ok(net.trunc())
}

/// The `/prefix` subnet that contains `host`.
pub fn containing_subnet(host: Ipv4Addr, prefix: u8) -> Result<Ipv4Net> {
    Ipv4Net::new(host, prefix)
        .map(|net| net.trunc())
        .map_err(|_| CoreError::PrefixOutOfRange { prefix, min: 0 })
}

/// The three private IPv4 blocks as canonical networks.
pub fn private_ranges() -> Vec<Ipv4Net> {
    PRIVATE_RANGES
        .iter()
        .filter_map(|r| r.parse::<Ipv4Net>().ok())
        .collect()
}

// ── Scan Units ────────────────────────────────────────────────────

/// One atomic unit of sweep work.
///
/// Units order by numeric base address, then by prefix length, so a subnet
/// sorts before the hosts inside it that share its base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ScanUnit {
    Subnet(Ipv4Net),
    Host(Ipv4Addr),
}

impl ScanUnit {
    /// Build a unit from a network. Host bits are cleared; a `/32` becomes a host unit.
    pub fn from_net(net: Ipv4Net) -> Self {
        if net.prefix_len() == 32 {
            Self::Host(net.addr())
        } else {
            Self::Subnet(net.trunc())
        }
    }

    pub fn base(&self) -> Ipv4Addr {
        match self {
            Self::Subnet(net) => net.network(),
            Self::Host(addr) => *addr,
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            Self::Subnet(net) => net.prefix_len(),
            Self::Host(_) => 32,
        }
    }

    /// The unit as a CIDR range.
    pub fn as_range(&self) -> Ipv4Net {
        match self {
            Self::Subnet(net) => *net,
            Self::Host(addr) => Ipv4Net::from(*addr),
        }
    }

    pub fn contains(&self, addr: &Ipv4Addr) -> bool {
        self.as_range().contains(addr)
    }

    /// The address, if this unit is a single host.
    pub fn host(&self) -> Option<Ipv4Addr> {
        match self {
            Self::Host(addr) => Some(*addr),
            Self::Subnet(_) => None,
        }
    }

    fn sort_key(&self) -> (u32, u8) {
        (u32::from(self.base()), self.prefix_len())
    }
}

impl Ord for ScanUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for ScanUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ScanUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subnet(net) => write!(f, "{net}"),
            Self::Host(addr) => write!(f, "{addr}"),
        }
    }
}

impl FromStr for ScanUnit {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidUnit(s.to_string()));
        }
        parse_range(trimmed)
            .map(Self::from_net)
            .map_err(|_| CoreError::InvalidUnit(trimmed.to_string()))
    }
}

impl From<ScanUnit> for String {
    fn from(unit: ScanUnit) -> Self {
        unit.to_string()
    }
}

impl TryFrom<String> for ScanUnit {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

// ── Scan Results ──────────────────────────────────────────────────

/// Outcome of one enumeration script against one host port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ScriptOutcome {
    /// The script ran and produced output.
    Output(String),
    /// The script ran but reported nothing.
    NoOutput,
    /// The script could not be run; other scripts for the host are unaffected.
    Failed(String),
}

impl ScriptOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// What a probe observed about a single host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    Liveness {
        host: Ipv4Addr,
        alive: bool,
        hostname: Option<String>,
    },
    PortState {
        host: Ipv4Addr,
        port: u16,
        open: bool,
    },
    VlanTag {
        host: Ipv4Addr,
        vlan_id: u16,
    },
    Service {
        host: Ipv4Addr,
        port: u16,
        script: String,
        outcome: ScriptOutcome,
    },
}

impl Finding {
    pub fn host(&self) -> Ipv4Addr {
        match self {
            Self::Liveness { host, .. }
            | Self::PortState { host, .. }
            | Self::VlanTag { host, .. }
            | Self::Service { host, .. } => *host,
        }
    }

    /// False for observations that only record an absence: a host that did
    /// not answer, or a port that was not open.
    pub fn is_positive(&self) -> bool {
        !matches!(
            self,
            Self::Liveness { alive: false, .. } | Self::PortState { open: false, .. }
        )
    }
}

/// A finding tagged with the unit that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub unit: ScanUnit,
    pub observed_at: DateTime<Utc>,
    pub finding: Finding,
}

impl ScanResult {
    pub fn new(unit: ScanUnit, finding: Finding) -> Self {
        Self {
            unit,
            observed_at: Utc::now(),
            finding,
        }
    }
}
