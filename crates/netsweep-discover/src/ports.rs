//! TCP port state checks via `nmap -Pn -p <ports>`.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use netsweep_core::{Finding, ScanResult, ScanUnit};

use crate::error::ProbeError;
use crate::probe::{require_host, Prober};
use crate::scanner::NmapScanner;

pub struct PortProber {
    scanner: NmapScanner,
    ports: Vec<u16>,
}

impl PortProber {
    pub fn new(scanner: NmapScanner, ports: Vec<u16>) -> Self {
        Self { scanner, ports }
    }

    /// State of every candidate port on `host`, in candidate order.
    ///
    /// A port nmap does not report as open, including one that never
    /// answered, is closed.
    pub async fn check(&self, host: Ipv4Addr) -> Result<Vec<(u16, bool)>, ProbeError> {
        if self.ports.is_empty() {
            return Ok(Vec::new());
        }

        let port_list = join_ports(&self.ports);
        let target = host.to_string();
        let run = self.scanner.run(&["-Pn", "-p", &port_list], &target).await?;
        let report = run.host(&target);

        Ok(self
            .ports
            .iter()
            .map(|&port| (port, report.is_some_and(|h| h.port_open(port))))
            .collect())
    }
}

#[async_trait]
impl Prober for PortProber {
    fn name(&self) -> &'static str {
        "ports"
    }

    async fn probe(&self, unit: &ScanUnit) -> Result<Vec<ScanResult>, ProbeError> {
        let host = require_host(self.name(), unit)?;
        let states = self.check(host).await?;

        Ok(states
            .into_iter()
            .map(|(port, open)| ScanResult::new(*unit, Finding::PortState { host, port, open }))
            .collect())
    }
}

/// Parse a comma-separated port list such as `80,443,445`.
pub fn parse_port_list(input: &str) -> Result<Vec<u16>, String> {
    let mut ports = Vec::new();
    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let port = part
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| format!("invalid port '{part}'"))?;
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    if ports.is_empty() {
        return Err("port list is empty".to_string());
    }
    Ok(ports)
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_list() {
        assert_eq!(parse_port_list("80, 443,445").unwrap(), vec![80, 443, 445]);
        assert_eq!(parse_port_list("445,445,139").unwrap(), vec![445, 139]);
        assert!(parse_port_list("80,http").is_err());
        assert!(parse_port_list("0").is_err());
        assert!(parse_port_list(" , ").is_err());
    }

    #[test]
    fn test_join_ports() {
        assert_eq!(join_ports(&[139, 445]), "139,445");
    }

    #[tokio::test]
    async fn test_empty_candidate_list_skips_nmap() {
        let prober = PortProber::new(NmapScanner::new("/nonexistent/nmap"), vec![]);
        let states = prober.check(Ipv4Addr::LOCALHOST).await.unwrap();
        assert!(states.is_empty());
    }
}
