//! Per-device enrichment: DNS, OUI, port-scan and SNMP passes driven by a
//! worker pool.
//!
//! Each pass is gated by its request flag and absorbs its own benign
//! errors; anything else halts that pass alone. The device always comes
//! back carrying whatever the completed passes found.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{EnrichmentConfig, PortScanConfig};
use crate::error::ProbeError;
use crate::model::{Device, Tag};
use crate::pool::{PoolHandles, WorkerPool};
use crate::probe::{PortList, PortScanOpts, Prober};
use crate::refdb::{AsnDb, OuiDb};

/// Manufacturer placeholder for privacy addresses.
const RANDOMIZED_MAC_MANUFACTURER: &str = "<randomized mac>";

/// Well-known TLS ports worth a handshake probe after a scan.
const TLS_PROBE_PORTS: [u16; 6] = [443, 465, 636, 993, 995, 8443];

/// One unit of enrichment work.
#[derive(Debug, Clone)]
pub struct EnrichDeviceRequest {
    pub device: Device,
    pub perform_dns: bool,
    pub perform_oui: bool,
    pub perform_portscan: bool,
    pub perform_snmp: bool,
}

impl EnrichDeviceRequest {
    /// Request with every pass the configuration enables.
    pub fn from_config(device: Device, cfg: &EnrichmentConfig) -> Self {
        Self {
            device,
            perform_dns: cfg.dns.enabled,
            perform_oui: cfg.oui.enabled,
            perform_portscan: cfg.portscan.enabled,
            perform_snmp: cfg.snmp.enabled,
        }
    }
}

/// The enrichment service: probing clients plus the reference tables.
pub struct Enricher {
    prober: Arc<Prober>,
    oui: Arc<OuiDb>,
    asn: Arc<AsnDb>,
    cfg: EnrichmentConfig,
    port_list: PortList,
}

impl Enricher {
    pub fn new(
        prober: Arc<Prober>,
        oui: Arc<OuiDb>,
        asn: Arc<AsnDb>,
        cfg: EnrichmentConfig,
    ) -> Result<Self, ProbeError> {
        let port_list: PortList = cfg.portscan.port_list.parse()?;
        Ok(Self {
            prober,
            oui,
            asn,
            cfg,
            port_list,
        })
    }

    /// Apply the requested passes to a copy of the device. A failing
    /// pass is logged and halted; the partially-enriched device is still
    /// returned.
    pub async fn enrich_device(
        &self,
        cancel: &CancellationToken,
        req: EnrichDeviceRequest,
    ) -> Result<Device, ProbeError> {
        let mut device = req.device;
        if req.perform_dns {
            if let Err(e) = self.dns_pass(cancel, &mut device).await {
                debug!(addr = %device.addr, error = %e, "dns pass halted");
            }
        }
        if req.perform_oui {
            oui_pass(&mut device, &self.oui);
        }
        asn_pass(&mut device, &self.asn);
        if req.perform_portscan {
            if let Err(e) = self.portscan_pass(cancel, &mut device).await {
                debug!(addr = %device.addr, error = %e, "port scan pass halted");
            }
        }
        if req.perform_snmp {
            if let Err(e) = self.snmp_pass(cancel, &mut device).await {
                debug!(addr = %device.addr, error = %e, "snmp pass halted");
            }
        }
        Ok(device)
    }

    /// Reverse-resolve the address unless a name is already known.
    async fn dns_pass(
        &self,
        cancel: &CancellationToken,
        device: &mut Device,
    ) -> Result<(), ProbeError> {
        if !device.meta.dns_name.is_empty() {
            return Ok(());
        }
        match self.prober.reverse_lookup(cancel, device.addr).await {
            Ok(name) => {
                device.set_dns_name(name);
                Ok(())
            }
            Err(ProbeError::NoDnsNames) => Ok(()),
            Err(e) if e.is_benign() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Replace the port list and stamp the scan time, then sort TLS
    /// services out of the answering ports.
    async fn portscan_pass(
        &self,
        cancel: &CancellationToken,
        device: &mut Device,
    ) -> Result<(), ProbeError> {
        let ports = self
            .prober
            .scan_tcp_ports(
                cancel,
                device.addr,
                PortScanOpts {
                    ports: self.port_list,
                    max_workers: self.cfg.portscan.max_workers,
                    response_timeout: self.cfg.portscan.timeout,
                },
            )
            .await?;

        let mut tls_ports = Vec::new();
        for &port in ports.iter().filter(|&&p| TLS_PROBE_PORTS.contains(&p)) {
            match self
                .prober
                .probe_tls(cancel, device.addr, port, tls_probe_timeout(&self.cfg.portscan))
                .await
            {
                Ok(_) => tls_ports.push(port),
                Err(e) => debug!(addr = %device.addr, port, error = %e, "tls probe failed"),
            }
        }

        device.server.is_server = !ports.is_empty();
        device.server.ports = ports;
        device.server.tls_ports = tls_ports;
        device.server.last_scan = Some(Utc::now());
        device.updated = true;
        Ok(())
    }

    /// Walk the credential grid; the first answering pair is remembered
    /// and queried once more for the system group. Only that final fetch
    /// surfaces its error.
    async fn snmp_pass(
        &self,
        cancel: &CancellationToken,
        device: &mut Device,
    ) -> Result<(), ProbeError> {
        device.snmp.last_check = Some(Utc::now());
        device.updated = true;

        let snmp = &self.cfg.snmp;
        let mut found: Option<(String, u16)> = None;
        'grid: for community in &snmp.community {
            for &port in &snmp.ports {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                match self
                    .prober
                    .snmp_system_info(cancel, device.addr, community, port, snmp.timeout)
                    .await
                {
                    Ok(_) => {
                        found = Some((community.clone(), port));
                        break 'grid;
                    }
                    Err(e) if e.is_benign() => {}
                    Err(e) => {
                        // best-effort search: keep walking the grid
                        debug!(addr = %device.addr, port, error = %e, "snmp probe failed");
                    }
                }
            }
        }

        let Some((community, port)) = found else {
            return Ok(());
        };
        device.snmp.community = community.clone();
        device.snmp.port = port;
        let info = self
            .prober
            .snmp_system_info(cancel, device.addr, &community, port, snmp.timeout)
            .await?;
        device.snmp.name = info.name;
        device.snmp.description = info.description;
        Ok(())
    }
}

/// A handshake needs more headroom than a bare connect.
fn tls_probe_timeout(cfg: &PortScanConfig) -> Duration {
    cfg.timeout.max(Duration::from_millis(250))
}

/// Vendor pass: randomized addresses are tagged instead of looked up; a
/// table hit clears any stale tag.
fn oui_pass(device: &mut Device, oui: &OuiDb) {
    if !device.meta.manufacturer.is_empty() {
        return;
    }
    let Some(mac) = device.mac else {
        return;
    };
    if mac.is_randomized() {
        device.add_tag(Tag::RandomizedMac);
        device.set_manufacturer(RANDOMIZED_MAC_MANUFACTURER);
        return;
    }
    if let Some(vendor) = oui.lookup(mac) {
        let vendor = vendor.to_string();
        device.set_manufacturer(vendor);
        device.remove_tag(Tag::RandomizedMac);
    }
}

/// ASN annotation for devices with globally routable addresses; LAN
/// addresses have no owning AS and are left alone.
fn asn_pass(device: &mut Device, asn: &AsnDb) {
    if !device.meta.asn.is_empty() || asn.is_empty() {
        return;
    }
    let std::net::IpAddr::V4(v4) = device.addr else {
        return;
    };
    if v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.is_multicast()
        || v4.is_broadcast()
    {
        return;
    }
    if let Some(owner) = asn.find_asn(device.addr) {
        let owner = owner.to_string();
        device.set_asn(owner);
    }
}

/// The shared enrichment pool, named for its log lines.
pub struct EnrichmentWorker {
    enricher: Arc<Enricher>,
    max_workers: usize,
}

impl EnrichmentWorker {
    pub fn new(enricher: Arc<Enricher>, max_workers: usize) -> Self {
        Self {
            enricher,
            max_workers,
        }
    }

    /// Launch the pool over a request channel; closing the sender drains
    /// and stops the workers.
    pub fn run(
        &self,
        cancel: CancellationToken,
        input: mpsc::Receiver<EnrichDeviceRequest>,
    ) -> PoolHandles<Device, ProbeError> {
        let enricher = Arc::clone(&self.enricher);
        let worker_cancel = cancel.clone();
        let pool = WorkerPool::new("enrichment", move |req: EnrichDeviceRequest| {
            let enricher = Arc::clone(&enricher);
            let cancel = worker_cancel.clone();
            async move { enricher.enrich_device(&cancel, req).await }
        });
        pool.run(cancel, self.max_workers, input)
    }
}

/// Predicate selecting devices whose last port scan is stale: servers age
/// against the server interval, everything else against the default one.
pub fn port_scanner_filter(cfg: &PortScanConfig) -> impl Fn(&Device) -> bool {
    let server_interval = chrono::Duration::from_std(cfg.server_scan_interval)
        .unwrap_or_else(|_| chrono::Duration::days(1));
    let default_interval = chrono::Duration::from_std(cfg.default_scan_interval)
        .unwrap_or_else(|_| chrono::Duration::days(7));
    move |device: &Device| {
        let interval = if device.server.is_server {
            server_interval
        } else {
            default_interval
        };
        match device.server.last_scan {
            None => true,
            Some(last) => Utc::now() - last > interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refdb::{CacheEntry, OuiEntry};

    fn acme_table() -> Arc<OuiDb> {
        Arc::new(OuiDb::from_entries(vec![OuiEntry {
            prefix: "AABBCC".into(),
            name: "Acme".into(),
        }]))
    }

    fn device_with_mac(mac: &str) -> Device {
        Device::with_mac("192.168.1.30".parse().unwrap(), mac.parse().unwrap())
    }

    #[test]
    fn test_oui_pass_sets_vendor_and_clears_tag() {
        let oui = acme_table();
        let mut device = device_with_mac("aa:bb:cc:11:22:33");
        device.meta.tags.push(Tag::RandomizedMac);

        oui_pass(&mut device, &oui);
        assert_eq!(device.meta.manufacturer, "Acme");
        assert!(!device.has_tag(Tag::RandomizedMac));
        assert!(device.updated);
    }

    #[test]
    fn test_oui_pass_tags_randomized_mac() {
        let oui = acme_table();
        // lower nibble 0x2 of the first octet: locally administered
        let mut device = device_with_mac("a2:bb:cc:11:22:33");

        oui_pass(&mut device, &oui);
        assert!(device.has_tag(Tag::RandomizedMac));
        assert_eq!(device.meta.manufacturer, RANDOMIZED_MAC_MANUFACTURER);
    }

    #[test]
    fn test_oui_pass_skips_when_manufacturer_known() {
        let oui = acme_table();
        let mut device = device_with_mac("aa:bb:cc:11:22:33");
        device.meta.manufacturer = "Existing".into();

        oui_pass(&mut device, &oui);
        assert_eq!(device.meta.manufacturer, "Existing");
        assert!(!device.updated);
    }

    #[test]
    fn test_oui_pass_miss_leaves_device_untouched() {
        let oui = acme_table();
        let mut device = device_with_mac("00:11:22:33:44:55");
        oui_pass(&mut device, &oui);
        assert_eq!(device.meta.manufacturer, "");
        assert!(!device.updated);
    }

    #[test]
    fn test_port_scanner_filter_ages() {
        let cfg = PortScanConfig::default();
        let filter = port_scanner_filter(&cfg);

        // never scanned
        let device = Device::new("10.0.0.1".parse().unwrap());
        assert!(filter(&device));

        // freshly scanned ordinary device
        let mut fresh = Device::new("10.0.0.2".parse().unwrap());
        fresh.server.last_scan = Some(Utc::now());
        assert!(!filter(&fresh));

        // a server two days past its scan is stale, an ordinary device
        // is not (7 day default interval)
        let two_days_ago = Utc::now() - chrono::Duration::days(2);
        let mut server = Device::new("10.0.0.3".parse().unwrap());
        server.server.is_server = true;
        server.server.last_scan = Some(two_days_ago);
        assert!(filter(&server));

        let mut ordinary = Device::new("10.0.0.4".parse().unwrap());
        ordinary.server.last_scan = Some(two_days_ago);
        assert!(!filter(&ordinary));
    }

    #[test]
    fn test_asn_pass_only_touches_global_addresses() {
        let asn = AsnDb::from_entries(vec![CacheEntry {
            asn: "AS1".into(),
            range: "1.0.0.0-1.0.0.255".parse().unwrap(),
        }]);

        let mut public = Device::new("1.0.0.42".parse().unwrap());
        asn_pass(&mut public, &asn);
        assert_eq!(public.meta.asn, "AS1");

        let mut private = Device::new("192.168.1.2".parse().unwrap());
        asn_pass(&mut private, &asn);
        assert_eq!(private.meta.asn, "");

        let mut unknown = Device::new("2.0.0.1".parse().unwrap());
        asn_pass(&mut unknown, &asn);
        assert_eq!(unknown.meta.asn, "");
    }

    #[tokio::test]
    async fn test_enrich_device_always_returns_the_device() {
        let enricher = Enricher::new(
            Arc::new(Prober::new().unwrap()),
            Arc::new(OuiDb::empty()),
            Arc::new(AsnDb::empty()),
            EnrichmentConfig::default(),
        )
        .unwrap();

        let device = device_with_mac("aa:bb:cc:11:22:33");
        let req = EnrichDeviceRequest {
            device: device.clone(),
            perform_dns: false,
            perform_oui: false,
            perform_portscan: false,
            perform_snmp: false,
        };
        let back = enricher
            .enrich_device(&CancellationToken::new(), req)
            .await
            .unwrap();
        assert_eq!(back, device);
    }

    #[test]
    fn test_request_flags_follow_config() {
        let mut cfg = EnrichmentConfig::default();
        cfg.snmp.enabled = false;
        let req = EnrichDeviceRequest::from_config(Device::new("10.0.0.1".parse().unwrap()), &cfg);
        assert!(req.perform_dns);
        assert!(req.perform_oui);
        assert!(req.perform_portscan);
        assert!(!req.perform_snmp);
    }
}
