//! Host liveness probing.
//!
//! Subnet units are ping-swept with `nmap -sn`, which reports only the hosts
//! that answered. Single hosts can also be checked with one ICMP echo via
//! the system `ping`, bounded by `-W 1` so an unresponsive host cannot hang.

use std::net::Ipv4Addr;
use std::process::Stdio;

use async_trait::async_trait;
use netsweep_core::{Finding, ScanResult, ScanUnit};
use tokio::process::Command;

use crate::error::ProbeError;
use crate::probe::{require_host, Prober};
use crate::scanner::NmapScanner;

const PING_SWEEP_FLAGS: &[&str] = &["-sn"];

/// How liveness is established.
#[derive(Debug, Clone)]
pub enum LivenessMethod {
    /// `nmap -sn` against the whole unit.
    PingSweep(NmapScanner),
    /// `ping -c 1 -W 1` against a single host.
    Icmp { ping_path: String },
}

pub struct LivenessProber {
    method: LivenessMethod,
}

impl LivenessProber {
    pub fn new(method: LivenessMethod) -> Self {
        Self { method }
    }

    pub fn ping_sweep(scanner: NmapScanner) -> Self {
        Self::new(LivenessMethod::PingSweep(scanner))
    }

    pub fn icmp(ping_path: &str) -> Self {
        Self::new(LivenessMethod::Icmp {
            ping_path: ping_path.to_string(),
        })
    }

    async fn sweep(
        &self,
        scanner: &NmapScanner,
        unit: &ScanUnit,
    ) -> Result<Vec<ScanResult>, ProbeError> {
        let run = scanner.run(PING_SWEEP_FLAGS, &unit.to_string()).await?;

        Ok(run
            .hosts
            .iter()
            .filter(|h| h.is_up())
            .filter_map(|h| {
                let host = h.ipv4()?.parse::<Ipv4Addr>().ok()?;
                Some(ScanResult::new(
                    *unit,
                    Finding::Liveness {
                        host,
                        alive: true,
                        hostname: h.hostname().map(String::from),
                    },
                ))
            })
            .collect())
    }

    async fn echo(&self, ping_path: &str, unit: &ScanUnit) -> Result<Vec<ScanResult>, ProbeError> {
        let host = require_host(self.name(), unit)?;

        let status = Command::new(ping_path)
            .args(["-c", "1", "-W", "1"])
            .arg(host.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| ProbeError::from_spawn(ping_path, e))?;

        Ok(vec![ScanResult::new(
            *unit,
            Finding::Liveness {
                host,
                alive: status.success(),
                hostname: None,
            },
        )])
    }
}

#[async_trait]
impl Prober for LivenessProber {
    fn name(&self) -> &'static str {
        "liveness"
    }

    async fn probe(&self, unit: &ScanUnit) -> Result<Vec<ScanResult>, ProbeError> {
        match &self.method {
            LivenessMethod::PingSweep(scanner) => self.sweep(scanner, unit).await,
            LivenessMethod::Icmp { ping_path } => self.echo(ping_path, unit).await,
        }
    }
}
