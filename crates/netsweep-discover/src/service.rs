//! Service enumeration with nmap NSE scripts.
//!
//! A host is first port-checked; hosts with none of the candidate ports open
//! are skipped. Each enumeration script then runs as its own nmap invocation
//! against each open service port, so a script that errors out is recorded as
//! [`ScriptOutcome::Failed`] without suppressing the others.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use netsweep_core::{Finding, ScanResult, ScanUnit, ScriptOutcome};

use crate::error::ProbeError;
use crate::ports::PortProber;
use crate::probe::{require_host, Prober};
use crate::scanner::NmapScanner;

pub struct ServiceProber {
    scanner: NmapScanner,
    port_check: PortProber,
    service_ports: Vec<u16>,
    scripts: Vec<String>,
}

impl ServiceProber {
    /// `candidate_ports` decide whether a host is worth enumerating;
    /// `service_ports` are the ones scripts run against when open.
    pub fn new(
        scanner: NmapScanner,
        candidate_ports: Vec<u16>,
        service_ports: Vec<u16>,
        scripts: Vec<String>,
    ) -> Self {
        Self {
            port_check: PortProber::new(scanner.clone(), candidate_ports),
            scanner,
            service_ports,
            scripts,
        }
    }

    async fn run_script(&self, host: Ipv4Addr, port: u16, script: &str) -> ScriptOutcome {
        let target = host.to_string();
        let port_arg = port.to_string();
        let flags = ["-Pn", "-p", port_arg.as_str(), "--script", script];

        match self.scanner.run(&flags, &target).await {
            Ok(run) => match run.host(&target).and_then(|h| h.script_output(script)) {
                Some(output) => ScriptOutcome::Output(output.trim().to_string()),
                None => ScriptOutcome::NoOutput,
            },
            Err(e) => {
                tracing::warn!(
                    host = %host,
                    port,
                    script,
                    error = %e,
                    "Enumeration script failed"
                );
                ScriptOutcome::Failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl Prober for ServiceProber {
    fn name(&self) -> &'static str {
        "service"
    }

    async fn probe(&self, unit: &ScanUnit) -> Result<Vec<ScanResult>, ProbeError> {
        let host = require_host(self.name(), unit)?;
        let states = self.port_check.check(host).await?;

        let mut results: Vec<ScanResult> = states
            .iter()
            .map(|&(port, open)| ScanResult::new(*unit, Finding::PortState { host, port, open }))
            .collect();

        let open: Vec<u16> = states
            .iter()
            .filter(|(_, open)| *open)
            .map(|(port, _)| *port)
            .collect();
        if open.is_empty() {
            tracing::debug!(host = %host, "No candidate ports open, skipping enumeration");
            return Ok(results);
        }

        for &port in self.service_ports.iter().filter(|p| open.contains(p)) {
            for script in &self.scripts {
                let outcome = self.run_script(host, port, script).await;
                results.push(ScanResult::new(
                    *unit,
                    Finding::Service {
                        host,
                        port,
                        script: script.clone(),
                        outcome,
                    },
                ));
            }
        }

        Ok(results)
    }
}
