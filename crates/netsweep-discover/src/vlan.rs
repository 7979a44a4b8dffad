//! 802.1Q tag probing.
//!
//! Sends a broadcast ARP request wrapped in an 802.1Q tag and waits briefly
//! for a tagged ARP reply from the target. No reply, or an untagged one, is
//! the common case and yields no finding rather than an error.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use netsweep_core::{Finding, ScanResult, ScanUnit};
use pnet::datalink::{self, Channel, Config, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::vlan::{ClassesOfService, MutableVlanPacket, VlanPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;

use crate::error::{DiscoverError, ProbeError};
use crate::probe::{require_host, Prober};

const ETH_HDR_LEN: usize = 14;
const VLAN_HDR_LEN: usize = 4;
const ARP_LEN: usize = 28;
const MIN_ETH_FRAME_NO_FCS: usize = 60;
const READ_POLL: Duration = Duration::from_millis(100);

pub struct VlanProber {
    interface: NetworkInterface,
    probe_vlan_id: u16,
    reply_timeout: Duration,
}

impl VlanProber {
    pub fn new(interface: NetworkInterface, probe_vlan_id: u16, reply_timeout: Duration) -> Self {
        Self {
            interface,
            probe_vlan_id,
            reply_timeout,
        }
    }
}

#[async_trait]
impl Prober for VlanProber {
    fn name(&self) -> &'static str {
        "vlan"
    }

    async fn probe(&self, unit: &ScanUnit) -> Result<Vec<ScanResult>, ProbeError> {
        let host = require_host(self.name(), unit)?;
        let interface = self.interface.clone();
        let vlan_id = self.probe_vlan_id;
        let timeout = self.reply_timeout;

        // The receive loop is bounded by `timeout`, so an abandoned task
        // still finishes and closes its channel on its own.
        let tag = tokio::task::spawn_blocking(move || tag_probe(&interface, host, vlan_id, timeout))
            .await
            .map_err(|e| ProbeError::Io(std::io::Error::other(e.to_string())))??;

        Ok(tag
            .map(|vlan_id| ScanResult::new(*unit, Finding::VlanTag { host, vlan_id }))
            .into_iter()
            .collect())
    }
}

/// Pick the interface to send tagged frames on: the named one, or the first
/// interface that is up, not loopback, and has a MAC and an IPv4 address.
pub fn select_interface(name: Option<&str>) -> Result<NetworkInterface, DiscoverError> {
    let interfaces = datalink::interfaces();
    let found = match name {
        Some(name) => interfaces.into_iter().find(|i| i.name == name),
        None => interfaces
            .into_iter()
            .find(|i| i.is_up() && !i.is_loopback() && i.mac.is_some() && ipv4_of(i).is_some()),
    };

    let interface = found.ok_or_else(|| {
        DiscoverError::Setup(match name {
            Some(n) => format!("network interface '{n}' not found"),
            None => "no usable network interface for VLAN probing".to_string(),
        })
    })?;
    if interface.mac.is_none() || ipv4_of(&interface).is_none() {
        return Err(DiscoverError::Setup(format!(
            "interface '{}' has no MAC or IPv4 address",
            interface.name
        )));
    }
    Ok(interface)
}

fn ipv4_of(interface: &NetworkInterface) -> Option<Ipv4Addr> {
    interface.ips.iter().find_map(|net| match net.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    })
}

fn tag_probe(
    interface: &NetworkInterface,
    target: Ipv4Addr,
    vlan_id: u16,
    timeout: Duration,
) -> Result<Option<u16>, ProbeError> {
    let src_mac = interface.mac.ok_or_else(|| ProbeError::Unsupported {
        prober: "vlan",
        target: interface.name.clone(),
    })?;
    let src_ip = ipv4_of(interface).ok_or_else(|| ProbeError::Unsupported {
        prober: "vlan",
        target: interface.name.clone(),
    })?;

    let config = Config {
        read_timeout: Some(READ_POLL),
        ..Default::default()
    };
    let (mut tx, mut rx) = match datalink::channel(interface, config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => {
            return Err(ProbeError::Unsupported {
                prober: "vlan",
                target: interface.name.clone(),
            })
        }
        Err(e) => return Err(ProbeError::from_spawn(&interface.name, e)),
    };

    let frame = build_tagged_arp(src_mac, src_ip, target, vlan_id);
    match tx.send_to(&frame, None) {
        Some(Ok(())) => {}
        Some(Err(e)) => return Err(ProbeError::from_spawn(&interface.name, e)),
        None => {
            return Err(ProbeError::Io(std::io::Error::other(
                "datalink sender refused frame",
            )))
        }
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match rx.next() {
            Ok(bytes) => {
                if let Some(tag) = parse_tagged_reply(bytes, target) {
                    return Ok(Some(tag));
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => return Err(ProbeError::Io(e)),
        }
    }

    Ok(None)
}

/// Ethernet broadcast / 802.1Q(vlan_id) / ARP who-has `target`.
fn build_tagged_arp(src_mac: MacAddr, src_ip: Ipv4Addr, target: Ipv4Addr, vlan_id: u16) -> Vec<u8> {
    let mut buffer = vec![0u8; MIN_ETH_FRAME_NO_FCS];

    if let Some(mut eth) = MutableEthernetPacket::new(&mut buffer[..ETH_HDR_LEN]) {
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(src_mac);
        eth.set_ethertype(EtherTypes::Vlan);
    }

    if let Some(mut tag) = MutableVlanPacket::new(&mut buffer[ETH_HDR_LEN..ETH_HDR_LEN + VLAN_HDR_LEN]) {
        tag.set_priority_code_point(ClassesOfService::BE);
        tag.set_drop_eligible_indicator(0);
        tag.set_vlan_identifier(vlan_id);
        tag.set_ethertype(EtherTypes::Arp);
    }

    let arp_start = ETH_HDR_LEN + VLAN_HDR_LEN;
    if let Some(mut arp) = MutableArpPacket::new(&mut buffer[arp_start..arp_start + ARP_LEN]) {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(src_mac);
        arp.set_sender_proto_addr(src_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target);
    }

    buffer
}

/// The VLAN ID of a tagged ARP reply sent by `target`, if `frame` is one.
fn parse_tagged_reply(frame: &[u8], target: Ipv4Addr) -> Option<u16> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Vlan {
        return None;
    }
    let tag = VlanPacket::new(eth.payload())?;
    if tag.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(tag.payload())?;
    if arp.get_operation() != ArpOperations::Reply || arp.get_sender_proto_addr() != target {
        return None;
    }
    Some(tag.get_vlan_identifier())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC_MAC: MacAddr = MacAddr(0x02, 0x00, 0x00, 0x00, 0x00, 0x01);
    const PEER_MAC: MacAddr = MacAddr(0x02, 0x00, 0x00, 0x00, 0x00, 0x99);

    fn tagged_reply(sender: Ipv4Addr, vlan_id: u16, op: pnet::packet::arp::ArpOperation) -> Vec<u8> {
        let mut frame = build_tagged_arp(PEER_MAC, sender, Ipv4Addr::new(10, 0, 0, 1), vlan_id);
        let arp_start = ETH_HDR_LEN + VLAN_HDR_LEN;
        let mut arp = MutableArpPacket::new(&mut frame[arp_start..arp_start + ARP_LEN]).unwrap();
        arp.set_operation(op);
        frame
    }

    #[test]
    fn request_frame_layout() {
        let target = Ipv4Addr::new(10, 0, 0, 42);
        let frame = build_tagged_arp(SRC_MAC, Ipv4Addr::new(10, 0, 0, 1), target, 1);
        assert_eq!(frame.len(), MIN_ETH_FRAME_NO_FCS);

        let eth = EthernetPacket::new(&frame).unwrap();
        assert_eq!(eth.get_destination(), MacAddr::broadcast());
        assert_eq!(eth.get_source(), SRC_MAC);
        assert_eq!(eth.get_ethertype(), EtherTypes::Vlan);

        let tag = VlanPacket::new(eth.payload()).unwrap();
        assert_eq!(tag.get_vlan_identifier(), 1);
        assert_eq!(tag.get_priority_code_point(), ClassesOfService::BE);
        assert_eq!(tag.get_drop_eligible_indicator(), 0);
        assert_eq!(tag.get_ethertype(), EtherTypes::Arp);

        let arp = ArpPacket::new(tag.payload()).unwrap();
        assert_eq!(arp.get_operation(), ArpOperations::Request);
        assert_eq!(arp.get_target_proto_addr(), target);
        assert_eq!(arp.get_sender_hw_addr(), SRC_MAC);
    }

    #[test]
    fn tagged_reply_from_target_yields_vlan() {
        let target = Ipv4Addr::new(10, 0, 0, 42);
        let frame = tagged_reply(target, 120, ArpOperations::Reply);
        assert_eq!(parse_tagged_reply(&frame, target), Some(120));
    }

    #[test]
    fn unrelated_frames_are_ignored() {
        let target = Ipv4Addr::new(10, 0, 0, 42);

        let other_host = tagged_reply(Ipv4Addr::new(10, 0, 0, 43), 120, ArpOperations::Reply);
        assert_eq!(parse_tagged_reply(&other_host, target), None);

        let request = tagged_reply(target, 120, ArpOperations::Request);
        assert_eq!(parse_tagged_reply(&request, target), None);

        let mut untagged = tagged_reply(target, 120, ArpOperations::Reply);
        MutableEthernetPacket::new(&mut untagged)
            .unwrap()
            .set_ethertype(EtherTypes::Arp);
        assert_eq!(parse_tagged_reply(&untagged, target), None);

        assert_eq!(parse_tagged_reply(&[0u8; 6], target), None);
    }
}
