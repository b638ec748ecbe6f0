//! Active probing toolkit: interface selection, ARP, ICMP echo and
//! traceroute, TCP port scanning and the narrow DNS/SNMP/TLS clients.
//!
//! Everything hangs off a [`Prober`] constructed once at startup so the
//! interface tables are built a single time and the ARP cache is shared.

pub mod arp;
pub mod dns;
pub mod icmp;
pub mod netif;
pub mod portscan;
pub mod snmp;
pub mod tls;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;

pub use arp::{ArpAnswer, ArpOpts};
pub use icmp::{EchoMode, EchoOpts, EchoResponse, EchoStatistics};
pub use portscan::{PortList, PortScanOpts};
pub use snmp::SnmpSystemInfo;
pub use tls::TlsProbeInfo;

/// The probing service: interface/route tables plus the ARP cache,
/// threaded as an explicit dependency instead of package-level state.
pub struct Prober {
    netif: Arc<netif::Netif>,
    arp: arp::ArpResolver,
}

impl Prober {
    pub fn new() -> std::io::Result<Self> {
        let netif = Arc::new(netif::Netif::discover()?);
        let arp = arp::ArpResolver::new(Arc::clone(&netif));
        Ok(Self { netif, arp })
    }

    pub fn netif(&self) -> &netif::Netif {
        &self.netif
    }

    pub async fn find_hardware_addr_of(
        &self,
        cancel: &CancellationToken,
        target: IpAddr,
        opts: ArpOpts,
    ) -> Result<ArpAnswer, ProbeError> {
        self.arp.find_hardware_addr_of(cancel, target, opts).await
    }

    pub async fn icmp4_echo(
        &self,
        cancel: &CancellationToken,
        target: IpAddr,
        opts: EchoOpts,
    ) -> Result<Vec<EchoResponse>, ProbeError> {
        icmp::icmp4_echo(cancel, target, opts).await
    }

    pub async fn traceroute4(
        &self,
        cancel: &CancellationToken,
        target: IpAddr,
        opts: EchoOpts,
    ) -> Result<Vec<EchoResponse>, ProbeError> {
        icmp::traceroute4(cancel, target, opts).await
    }

    pub async fn scan_tcp_ports(
        &self,
        cancel: &CancellationToken,
        target: IpAddr,
        opts: PortScanOpts,
    ) -> Result<Vec<u16>, ProbeError> {
        portscan::scan_tcp_ports(cancel, target, opts).await
    }

    pub async fn reverse_lookup(
        &self,
        cancel: &CancellationToken,
        addr: IpAddr,
    ) -> Result<String, ProbeError> {
        dns::reverse_lookup(cancel, addr).await
    }

    pub async fn snmp_system_info(
        &self,
        cancel: &CancellationToken,
        target: IpAddr,
        community: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<SnmpSystemInfo, ProbeError> {
        snmp::get_system_info(cancel, target, community, port, timeout).await
    }

    pub async fn probe_tls(
        &self,
        cancel: &CancellationToken,
        target: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> Result<TlsProbeInfo, ProbeError> {
        tls::probe_tls(cancel, target, port, timeout).await
    }
}
