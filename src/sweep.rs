//! Discovery sweep: walk each managed network's host addresses, probe for
//! life and post responders onto the bus.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use ipnetwork::IpNetwork;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Event};
use crate::config::DiscoveryConfig;
use crate::error::ProbeError;
use crate::model::{Device, Network};
use crate::pool::WorkerPool;
use crate::probe::{ArpOpts, EchoMode, EchoOpts, Prober};
use crate::store::ComboStore;

pub struct Sweeper {
    prober: Arc<Prober>,
    store: Arc<Mutex<ComboStore>>,
    bus: Bus,
    cfg: DiscoveryConfig,
}

impl Sweeper {
    pub fn new(
        prober: Arc<Prober>,
        store: Arc<Mutex<ComboStore>>,
        bus: Bus,
        cfg: DiscoveryConfig,
    ) -> Self {
        Self {
            prober,
            store,
            bus,
            cfg,
        }
    }

    /// Sweep every managed network on the configured interval until
    /// cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let networks = self.store.lock().await.list_networks().to_vec();
            for network in networks {
                if cancel.is_cancelled() {
                    return;
                }
                self.sweep_network(&cancel, &network).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.interval) => {}
            }
        }
    }

    /// Probe every host address of one network and publish responders.
    pub async fn sweep_network(&self, cancel: &CancellationToken, network: &Network) {
        let targets = host_addrs(network.prefix);
        if targets.is_empty() {
            debug!(network = %network.prefix, "nothing to sweep");
            return;
        }
        info!(network = %network.prefix, hosts = targets.len(), "sweeping");

        let prober = Arc::clone(&self.prober);
        let timeout = self.cfg.timeout;
        let probe_cancel = cancel.clone();
        let pool = WorkerPool::new("sweep", move |addr: IpAddr| {
            let prober = Arc::clone(&prober);
            let cancel = probe_cancel.clone();
            async move { probe_host(&prober, &cancel, addr, timeout).await }
        });

        let (input_tx, input_rx) = mpsc::channel(self.cfg.max_workers.max(1));
        let mut handles = pool.run(cancel.clone(), self.cfg.max_workers, input_rx);

        let feeder = tokio::spawn(async move {
            for addr in targets {
                if input_tx.send(addr).await.is_err() {
                    break;
                }
            }
        });

        let mut found = 0usize;
        let mut output_open = true;
        let mut errors_open = true;
        while output_open || errors_open {
            tokio::select! {
                device = handles.output.recv(), if output_open => match device {
                    Some(Some(device)) => {
                        found += 1;
                        self.bus.publish(Event::DeviceDiscovered(device));
                    }
                    Some(None) => {}
                    None => output_open = false,
                },
                err = handles.errors.recv(), if errors_open => match err {
                    Some(err) => debug!(network = %network.prefix, error = %err, "sweep probe failed"),
                    None => errors_open = false,
                },
            }
        }
        let _ = feeder.await;
        let _ = handles.done.await;

        let mut swept = network.clone();
        swept.last_sweep = Some(Utc::now());
        if let Err(e) = self.store.lock().await.update_network(&swept) {
            warn!(network = %network.prefix, error = %e, "failed to stamp sweep time");
        }
        info!(network = %network.prefix, found, "sweep finished");
    }
}

/// One liveness probe: unprivileged echo first, raw echo when the
/// datagram socket is unavailable, then an ARP resolve for on-link
/// responders to capture the hardware address.
async fn probe_host(
    prober: &Prober,
    cancel: &CancellationToken,
    addr: IpAddr,
    timeout: std::time::Duration,
) -> Result<Option<Device>, ProbeError> {
    // one of our own addresses: no probe needed, the interface table
    // already knows the hardware address
    if let Some(iface) = prober.netif().interface_of_addr(addr) {
        let mut device = Device::new(addr);
        device.mac = iface.mac;
        device.mark_seen(Utc::now());
        return Ok(Some(device));
    }

    let opts = EchoOpts {
        count: 1,
        read_timeout: timeout,
        between: std::time::Duration::ZERO,
        ..EchoOpts::default()
    };
    let responses = match prober.icmp4_echo(cancel, addr, opts.clone()).await {
        Ok(responses) => responses,
        Err(ProbeError::Io(_)) => {
            prober
                .icmp4_echo(
                    cancel,
                    addr,
                    EchoOpts {
                        mode: EchoMode::Raw,
                        ..opts
                    },
                )
                .await?
        }
        Err(e) => return Err(e),
    };

    let alive = responses.iter().any(|r| r.is_success());
    if !alive {
        return Ok(None);
    }

    let mut device = Device::new(addr);
    device.mark_seen(Utc::now());
    if prober.netif().is_on_link(addr) {
        match prober
            .find_hardware_addr_of(cancel, addr, ArpOpts::default())
            .await
        {
            Ok(answer) => device.mac = Some(answer.mac),
            Err(e) if e.is_benign() => {}
            Err(e) => debug!(addr = %addr, error = %e, "arp resolve failed"),
        }
    }
    Ok(Some(device))
}

/// Every host address of a v4 prefix, network and broadcast excluded
/// (a /31 or /32 keeps everything). IPv6 prefixes yield nothing. Wide
/// prefixes are walked in full; the worker pool bounds how many probes
/// are in flight, not how far the sweep reaches.
fn host_addrs(prefix: IpNetwork) -> Vec<IpAddr> {
    let IpNetwork::V4(v4) = prefix else {
        return Vec::new();
    };
    let network = v4.network();
    let broadcast = v4.broadcast();
    v4.iter()
        .filter(|ip| v4.prefix() >= 31 || (*ip != network && *ip != broadcast))
        .map(IpAddr::V4)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_addrs_excludes_network_and_broadcast() {
        let addrs = host_addrs("192.168.1.0/30".parse().unwrap());
        assert_eq!(
            addrs,
            vec![
                "192.168.1.1".parse::<IpAddr>().unwrap(),
                "192.168.1.2".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_host_addrs_keeps_point_to_point_pairs() {
        let addrs = host_addrs("10.0.0.0/31".parse().unwrap());
        assert_eq!(addrs.len(), 2);
        let single = host_addrs("10.0.0.7/32".parse().unwrap());
        assert_eq!(single, vec!["10.0.0.7".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_host_addrs_covers_wide_prefixes_in_full() {
        let addrs = host_addrs("10.0.0.0/16".parse().unwrap());
        assert_eq!(addrs.len(), 65534);
        assert!(addrs.contains(&"10.0.255.254".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_host_addrs_rejects_ipv6() {
        assert!(host_addrs("fd00::/64".parse().unwrap()).is_empty());
    }
}
