//! Nmap XML output deserialization.
//!
//! Every nmap-backed prober runs with `-oX -` and reads the report from
//! stdout. Only the elements the probers consume are modelled: host status,
//! addresses, names, port states, and NSE script output.

use serde::Deserialize;

use crate::error::ProbeError;

/// Root element: `<nmaprun>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "nmaprun")]
pub struct NmapRun {
    #[serde(rename = "host", default)]
    pub hosts: Vec<NmapHost>,
    pub runstats: Option<RunStats>,
}

/// A single host from scan results.
#[derive(Debug, Clone, Deserialize)]
pub struct NmapHost {
    pub status: Option<HostStatus>,
    #[serde(rename = "address", default)]
    pub addresses: Vec<Address>,
    pub hostnames: Option<Hostnames>,
    pub ports: Option<Ports>,
    pub hostscript: Option<HostScripts>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostStatus {
    #[serde(rename = "@state")]
    pub state: String,
    #[serde(rename = "@reason")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Address {
    #[serde(rename = "@addr")]
    pub addr: String,
    #[serde(rename = "@addrtype")]
    pub addr_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hostnames {
    #[serde(rename = "hostname", default)]
    pub hostnames: Vec<Hostname>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hostname {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ports {
    #[serde(rename = "port", default)]
    pub ports: Vec<NmapPort>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NmapPort {
    #[serde(rename = "@protocol")]
    pub protocol: String,
    #[serde(rename = "@portid")]
    pub port_id: u16,
    pub state: PortState,
    #[serde(rename = "script", default)]
    pub scripts: Vec<NmapScript>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortState {
    #[serde(rename = "@state")]
    pub state: String,
}

/// Output of one NSE script.
#[derive(Debug, Clone, Deserialize)]
pub struct NmapScript {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@output")]
    pub output: String,
}

/// Host-level script results (`<hostscript>`), e.g. `smb-os-discovery`.
#[derive(Debug, Clone, Deserialize)]
pub struct HostScripts {
    #[serde(rename = "script", default)]
    pub scripts: Vec<NmapScript>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunStats {
    pub hosts: Option<RunStatsHosts>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunStatsHosts {
    #[serde(rename = "@up")]
    pub up: Option<String>,
    #[serde(rename = "@total")]
    pub total: Option<String>,
}

impl NmapRun {
    /// Find the report for a specific IPv4 address.
    pub fn host(&self, ip: &str) -> Option<&NmapHost> {
        self.hosts.iter().find(|h| h.ipv4() == Some(ip))
    }
}

impl NmapHost {
    /// Extract the IPv4 address, if present.
    pub fn ipv4(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.addr_type == "ipv4")
            .map(|a| a.addr.as_str())
    }

    /// Extract the first hostname, if present.
    pub fn hostname(&self) -> Option<&str> {
        self.hostnames
            .as_ref()
            .and_then(|hn| hn.hostnames.first())
            .map(|h| h.name.as_str())
    }

    /// Check if the host is up.
    pub fn is_up(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.state == "up")
    }

    /// Whether nmap reported `port` as open. Unlisted ports are closed.
    pub fn port_open(&self, port: u16) -> bool {
        self.ports
            .as_ref()
            .and_then(|p| p.ports.iter().find(|np| np.port_id == port))
            .is_some_and(|np| np.state.state == "open")
    }

    /// Output of script `id`, from the port scripts or the host scripts.
    pub fn script_output(&self, id: &str) -> Option<&str> {
        let port_scripts = self
            .ports
            .iter()
            .flat_map(|p| p.ports.iter())
            .flat_map(|np| np.scripts.iter());
        let host_scripts = self.hostscript.iter().flat_map(|h| h.scripts.iter());

        port_scripts
            .chain(host_scripts)
            .find(|s| s.id == id)
            .map(|s| s.output.as_str())
    }
}

/// Parse nmap XML bytes into a structured `NmapRun`.
pub fn parse_nmap_xml(xml: &[u8]) -> Result<NmapRun, ProbeError> {
    quick_xml::de::from_reader(xml).map_err(|e| ProbeError::Parse(format!("{e}")))
}
