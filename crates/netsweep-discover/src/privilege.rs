//! Raw-socket privilege check.

use is_root::is_root;

use crate::config::SweepMode;
use crate::error::{DiscoverError, Result};

/// Whether `mode` opens raw sockets (ICMP, nmap ping sweeps, tagged frames).
pub fn requires_root(mode: SweepMode) -> bool {
    matches!(mode, SweepMode::Subnets | SweepMode::Hosts)
}

/// Fail with [`DiscoverError::InsufficientPrivilege`] when `mode` needs root
/// and the process does not have it.
pub fn check(mode: SweepMode) -> Result<()> {
    if requires_root(mode) && !is_root() {
        return Err(DiscoverError::InsufficientPrivilege(format!(
            "the {mode} sweep needs root to open raw sockets; re-run with sudo"
        )));
    }
    Ok(())
}
