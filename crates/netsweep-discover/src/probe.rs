//! The probe capability the scheduler drives.
//!
//! A [`Prober`] performs one kind of network probe against one unit. The
//! scheduler owns timing: it may drop a probe future at any await point, so
//! implementations must release their resources on drop (child processes
//! are spawned with `kill_on_drop`, raw sockets carry their own read timeout).

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use netsweep_core::{Finding, ScanResult, ScanUnit};

use crate::error::ProbeError;

#[async_trait]
pub trait Prober: Send + Sync {
    /// Short name used in logs and failure reports.
    fn name(&self) -> &'static str;

    /// Probe `unit` once. "Nothing observed" is `Ok(vec![])`, not an error.
    async fn probe(&self, unit: &ScanUnit) -> Result<Vec<ScanResult>, ProbeError>;
}

/// The host address of a single-host unit, or `Unsupported` for subnets.
pub fn require_host(prober: &'static str, unit: &ScanUnit) -> Result<Ipv4Addr, ProbeError> {
    unit.host().ok_or_else(|| ProbeError::Unsupported {
        prober,
        target: unit.to_string(),
    })
}

/// Runs a second prober against every host the first one reports alive.
///
/// Follow-up failures are logged and dropped; the primary findings are
/// always returned.
pub struct FollowUpProber {
    primary: Arc<dyn Prober>,
    follow_up: Arc<dyn Prober>,
}

impl FollowUpProber {
    pub fn new(primary: Arc<dyn Prober>, follow_up: Arc<dyn Prober>) -> Self {
        Self { primary, follow_up }
    }
}

#[async_trait]
impl Prober for FollowUpProber {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn probe(&self, unit: &ScanUnit) -> Result<Vec<ScanResult>, ProbeError> {
        let mut results = self.primary.probe(unit).await?;

        let live: Vec<Ipv4Addr> = results
            .iter()
            .filter_map(|r| match &r.finding {
                Finding::Liveness {
                    host, alive: true, ..
                } => Some(*host),
                _ => None,
            })
            .collect();

        for host in live {
            match self.follow_up.probe(&ScanUnit::Host(host)).await {
                Ok(extra) => results.extend(extra.into_iter().map(|mut r| {
                    r.unit = *unit;
                    r
                })),
                Err(e) => tracing::warn!(
                    host = %host,
                    prober = self.follow_up.name(),
                    error = %e,
                    "Follow-up probe failed"
                ),
            }
        }

        Ok(results)
    }
}
