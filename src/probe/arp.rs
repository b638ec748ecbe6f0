//! ARP resolution with an in-memory cache.
//!
//! Resolution opens a datalink channel on the interface covering the
//! target, broadcasts one request and reads replies until the response
//! deadline passes.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;
use pnet_datalink::{Channel, NetworkInterface};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProbeError;
use crate::model::Mac;
use crate::probe::netif::Netif;

/// Default time to wait for a reply.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ArpOpts {
    pub response_timeout: Duration,
    pub skip_cache: bool,
}

impl Default for ArpOpts {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            skip_cache: false,
        }
    }
}

/// A resolved address pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpAnswer {
    pub addr: Ipv4Addr,
    pub mac: Mac,
}

/// IPv4 → MAC resolver. One instance owns the cache; resolution itself is
/// stateless beyond it.
pub struct ArpResolver {
    netif: Arc<Netif>,
    cache: Mutex<HashMap<Ipv4Addr, Mac>>,
}

impl ArpResolver {
    pub fn new(netif: Arc<Netif>) -> Self {
        Self {
            netif,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached(&self, addr: Ipv4Addr) -> Option<Mac> {
        self.cache.lock().ok()?.get(&addr).copied()
    }

    /// Resolve `target` to its hardware address.
    ///
    /// Cache hits return immediately unless `skip_cache` is set. A miss
    /// probes on the best interface for the target and records the answer.
    pub async fn find_hardware_addr_of(
        &self,
        cancel: &CancellationToken,
        target: IpAddr,
        opts: ArpOpts,
    ) -> Result<ArpAnswer, ProbeError> {
        let IpAddr::V4(target) = target else {
            return Err(ProbeError::Ipv6Unsupported);
        };

        if !opts.skip_cache {
            if let Some(mac) = self.cached(target) {
                return Ok(ArpAnswer { addr: target, mac });
            }
        }

        let iface = self
            .netif
            .best_interface(IpAddr::V4(target))
            .ok_or(ProbeError::NoInterface(IpAddr::V4(target)))?;
        let iface_name = iface.name.clone();
        let source_ip = match self.netif.addr_of_iface(&iface_name, true) {
            Some(IpAddr::V4(v4)) => Some(v4),
            _ => None,
        };

        let cancel = cancel.clone();
        let answer = tokio::task::spawn_blocking(move || {
            resolve_on_interface(&cancel, &iface_name, source_ip, target, opts.response_timeout)
        })
        .await
        .map_err(|e| ProbeError::Io(std::io::Error::other(e)))??;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(answer.addr, answer.mac);
        }
        Ok(answer)
    }
}

/// Blocking resolve on a named interface. All reads carry a deadline so
/// the call returns within `response_timeout` plus one read interval.
fn resolve_on_interface(
    cancel: &CancellationToken,
    iface_name: &str,
    source_ip: Option<Ipv4Addr>,
    target: Ipv4Addr,
    response_timeout: Duration,
) -> Result<ArpAnswer, ProbeError> {
    let iface = pnet_datalink::interfaces()
        .into_iter()
        .find(|i| i.name == iface_name)
        .ok_or_else(|| {
            ProbeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("interface {iface_name} not found"),
            ))
        })?;
    let source_mac = iface
        .mac
        .ok_or_else(|| ProbeError::Io(std::io::Error::other("interface has no mac")))?;
    let source_ip = source_ip
        .or_else(|| interface_ipv4(&iface))
        .ok_or(ProbeError::NoInterface(IpAddr::V4(target)))?;

    let config = pnet_datalink::Config {
        read_timeout: Some(Duration::from_millis(10)),
        ..Default::default()
    };
    let (mut tx, mut rx) = match pnet_datalink::channel(&iface, config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => return Err(ProbeError::Io(std::io::Error::other("unsupported channel type"))),
        Err(e) => return Err(ProbeError::Io(e)),
    };

    send_request(&mut tx, source_mac, source_ip, target)?;

    let deadline = Instant::now() + response_timeout;
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return Err(ProbeError::NoResponseFromRemote);
        }
        // read_timeout makes this a bounded wait, not a busy loop
        let frame = match rx.next() {
            Ok(frame) => frame,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(e) => return Err(ProbeError::Io(e)),
        };
        if let Some(mac) = parse_reply(frame, source_mac, target) {
            return Ok(ArpAnswer { addr: target, mac });
        }
    }

    debug!(target = %target, iface = iface_name, "arp deadline passed");
    Err(ProbeError::NoResponseFromRemote)
}

fn interface_ipv4(iface: &NetworkInterface) -> Option<Ipv4Addr> {
    iface.ips.iter().find_map(|ip| match ip.ip() {
        IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
        _ => None,
    })
}

fn send_request(
    tx: &mut Box<dyn pnet_datalink::DataLinkSender>,
    source_mac: MacAddr,
    source_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Result<(), ProbeError> {
    // Ethernet (14) + ARP (28)
    let mut ethernet_buffer = [0u8; 42];
    let mut ethernet_packet = MutableEthernetPacket::new(&mut ethernet_buffer)
        .ok_or_else(|| ProbeError::Io(std::io::Error::other("ethernet buffer too small")))?;

    ethernet_packet.set_destination(MacAddr::broadcast());
    ethernet_packet.set_source(source_mac);
    ethernet_packet.set_ethertype(EtherTypes::Arp);

    let mut arp_buffer = [0u8; 28];
    let mut arp_packet = MutableArpPacket::new(&mut arp_buffer)
        .ok_or_else(|| ProbeError::Io(std::io::Error::other("arp buffer too small")))?;

    arp_packet.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp_packet.set_protocol_type(EtherTypes::Ipv4);
    arp_packet.set_hw_addr_len(6);
    arp_packet.set_proto_addr_len(4);
    arp_packet.set_operation(ArpOperations::Request);
    arp_packet.set_sender_hw_addr(source_mac);
    arp_packet.set_sender_proto_addr(source_ip);
    arp_packet.set_target_hw_addr(MacAddr::zero());
    arp_packet.set_target_proto_addr(target_ip);

    ethernet_packet.set_payload(arp_packet.packet());

    tx.send_to(ethernet_packet.packet(), None)
        .ok_or_else(|| ProbeError::Io(std::io::Error::other("datalink send unavailable")))?
        .map_err(ProbeError::Io)
}

/// Extract the sender MAC from a reply for `target`, ignoring our own
/// frames and unrelated traffic.
fn parse_reply(frame: &[u8], our_mac: MacAddr, target: Ipv4Addr) -> Option<Mac> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(ethernet.payload())?;
    if arp.get_operation() != ArpOperations::Reply {
        return None;
    }
    if arp.get_sender_hw_addr() == our_mac {
        return None;
    }
    if arp.get_sender_proto_addr() != target {
        return None;
    }
    Some(Mac::from(arp.get_sender_hw_addr()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_frame(sender_mac: MacAddr, sender_ip: Ipv4Addr) -> Vec<u8> {
        let mut ethernet_buffer = vec![0u8; 42];
        let mut ethernet_packet = MutableEthernetPacket::new(&mut ethernet_buffer).unwrap();
        ethernet_packet.set_destination(MacAddr::broadcast());
        ethernet_packet.set_source(sender_mac);
        ethernet_packet.set_ethertype(EtherTypes::Arp);

        let mut arp_buffer = [0u8; 28];
        let mut arp_packet = MutableArpPacket::new(&mut arp_buffer).unwrap();
        arp_packet.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp_packet.set_protocol_type(EtherTypes::Ipv4);
        arp_packet.set_hw_addr_len(6);
        arp_packet.set_proto_addr_len(4);
        arp_packet.set_operation(ArpOperations::Reply);
        arp_packet.set_sender_hw_addr(sender_mac);
        arp_packet.set_sender_proto_addr(sender_ip);
        arp_packet.set_target_hw_addr(MacAddr::new(2, 2, 2, 2, 2, 2));
        arp_packet.set_target_proto_addr(Ipv4Addr::new(192, 168, 1, 5));
        ethernet_packet.set_payload(arp_packet.packet());
        ethernet_buffer
    }

    #[test]
    fn test_parse_reply_matches_target() {
        let our_mac = MacAddr::new(2, 2, 2, 2, 2, 2);
        let sender_mac = MacAddr::new(0xaa, 0xbb, 0xcc, 1, 2, 3);
        let sender_ip = Ipv4Addr::new(192, 168, 1, 9);
        let frame = reply_frame(sender_mac, sender_ip);

        let mac = parse_reply(&frame, our_mac, sender_ip).unwrap();
        assert_eq!(mac, Mac::from(sender_mac));

        // a reply from a different sender is ignored
        assert!(parse_reply(&frame, our_mac, Ipv4Addr::new(192, 168, 1, 10)).is_none());
        // our own frames are ignored
        assert!(parse_reply(&frame, sender_mac, sender_ip).is_none());
    }

    #[tokio::test]
    async fn test_ipv6_rejected() {
        let resolver = ArpResolver::new(Arc::new(Netif::default()));
        let err = resolver
            .find_hardware_addr_of(
                &CancellationToken::new(),
                "::1".parse().unwrap(),
                ArpOpts::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Ipv6Unsupported));
    }

    #[tokio::test]
    async fn test_cache_short_circuits_probe() {
        // no interfaces registered, so a cache hit is the only way this
        // can succeed
        let resolver = ArpResolver::new(Arc::new(Netif::default()));
        let addr = Ipv4Addr::new(10, 0, 0, 7);
        let mac: Mac = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        resolver.cache.lock().unwrap().insert(addr, mac);

        let answer = resolver
            .find_hardware_addr_of(
                &CancellationToken::new(),
                IpAddr::V4(addr),
                ArpOpts::default(),
            )
            .await
            .unwrap();
        assert_eq!(answer, ArpAnswer { addr, mac });

        // skip_cache forces the probe path, which has no interface to use
        let err = resolver
            .find_hardware_addr_of(
                &CancellationToken::new(),
                IpAddr::V4(addr),
                ArpOpts {
                    skip_cache: true,
                    ..ArpOpts::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NoInterface(_)));
    }
}
