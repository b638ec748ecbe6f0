//! Combined network/device store.
//!
//! Authoritative in-memory vectors snapshotted to msgpack files on every
//! mutation, plus one whisper timeseries file per device and ping metric.
//! The store does no internal locking; callers serialize mutators.

pub mod whisper;

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use ipnetwork::IpNetwork;
use tracing::debug;

use crate::config::ComboStoreConfig;
use crate::error::StoreError;
use crate::model::{Device, Network};
use crate::probe::EchoStatistics;
use whisper::{Aggregation, Retention, Whisper};

const NETWORKS_SNAPSHOT: &str = "networks.mb";
const DEVICES_SNAPSHOT: &str = "devices.mb";

const METRIC_PING_AVG: &str = "pingavg";
const METRIC_PING_MAX: &str = "pingmax";
const METRIC_PING_LOSS: &str = "pingloss";

const WHISPER_X_FILES_FACTOR: f32 = 0.5;

/// One zipped sample of the three ping series.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformancePoint {
    pub device: IpAddr,
    pub start: DateTime<Utc>,
    pub average: f64,
    pub maximum: f64,
    /// Percent, scaled from the stored ratio.
    pub loss: f64,
}

pub struct ComboStore {
    dir: PathBuf,
    retentions: Vec<Retention>,
    networks: Vec<Network>,
    devices: Vec<Device>,
}

impl ComboStore {
    /// Open the store, loading any snapshots present in the directory.
    /// Missing snapshot files are a clean empty start.
    pub fn open(cfg: &ComboStoreConfig) -> Result<Self, StoreError> {
        platform_supported()?;
        let dir = PathBuf::from(&cfg.directory);
        std::fs::create_dir_all(&dir)?;
        let retentions = whisper::parse_retentions(&cfg.wsp_retention)?;

        let networks = load_snapshot(&dir.join(NETWORKS_SNAPSHOT))?;
        let devices = load_snapshot(&dir.join(DEVICES_SNAPSHOT))?;
        debug!(
            networks = networks.len(),
            devices = devices.len(),
            dir = %dir.display(),
            "store opened"
        );

        Ok(Self {
            dir,
            retentions,
            networks,
            devices,
        })
    }

    // ---- networks ----

    pub fn list_networks(&self) -> &[Network] {
        &self.networks
    }

    /// Add a network. Fails when any stored network's prefix already
    /// contains the new network's base address.
    pub fn add_network(&mut self, network: Network) -> Result<(), StoreError> {
        platform_supported()?;
        let base = network.prefix.network();
        if self.networks.iter().any(|n| n.prefix.contains(base)) {
            return Err(StoreError::NetworkExists);
        }
        self.networks.push(network);
        self.persist_networks()
    }

    /// Overlay `network` onto the stored entry with the same prefix.
    pub fn update_network(&mut self, network: &Network) -> Result<(), StoreError> {
        platform_supported()?;
        let found = self
            .networks
            .iter_mut()
            .find(|n| n.prefix == network.prefix)
            .ok_or(StoreError::NetworkNotFound)?;
        if !network.name.is_empty() {
            found.name = network.name.clone();
        }
        if network.last_sweep.is_some() {
            found.last_sweep = network.last_sweep;
        }
        self.persist_networks()
    }

    pub fn upsert_network(&mut self, network: Network) -> Result<(), StoreError> {
        match self.update_network(&network) {
            Err(StoreError::NetworkNotFound) => self.add_network(network),
            other => other,
        }
    }

    pub fn remove_network(&mut self, prefix: IpNetwork) -> Result<(), StoreError> {
        platform_supported()?;
        let idx = self
            .networks
            .iter()
            .position(|n| n.prefix == prefix)
            .ok_or(StoreError::NetworkNotFound)?;
        self.networks.remove(idx);
        self.persist_networks()
    }

    // ---- devices ----

    pub fn list_devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn get_device(&self, addr: IpAddr) -> Option<&Device> {
        self.devices.iter().find(|d| d.addr == addr)
    }

    pub fn add_device(&mut self, device: Device) -> Result<(), StoreError> {
        platform_supported()?;
        if self.devices.iter().any(|d| d.addr == device.addr) {
            return Err(StoreError::DeviceExists);
        }
        self.devices.push(device);
        self.persist_devices()
    }

    /// Merge `device` onto the stored entry with the same address. A
    /// device whose dirty flag is unset is a no-op.
    pub fn update_device(&mut self, device: &Device) -> Result<(), StoreError> {
        platform_supported()?;
        if !device.updated {
            return Ok(());
        }
        let found = self
            .devices
            .iter_mut()
            .find(|d| d.addr == device.addr)
            .ok_or(StoreError::DeviceNotFound)?;
        found.merge(device);
        found.updated = false;
        self.persist_devices()
    }

    pub fn upsert_device(&mut self, mut device: Device) -> Result<(), StoreError> {
        device.updated = true;
        match self.update_device(&device) {
            Err(StoreError::DeviceNotFound) => {
                device.updated = false;
                self.add_device(device)
            }
            other => other,
        }
    }

    pub fn remove_device(&mut self, addr: IpAddr) -> Result<(), StoreError> {
        platform_supported()?;
        let idx = self
            .devices
            .iter()
            .position(|d| d.addr == addr)
            .ok_or(StoreError::DeviceNotFound)?;
        self.devices.remove(idx);
        self.persist_devices()
    }

    // ---- timeseries ----

    /// Append one sample to each of the device's three ping series, in
    /// avg → max → loss order. Average and maximum are stored in
    /// milliseconds, loss as the raw ratio.
    pub fn write_performance_ping(
        &self,
        ts: DateTime<Utc>,
        device: &Device,
        stats: &EchoStatistics,
    ) -> Result<(), StoreError> {
        platform_supported()?;
        let timestamp = ts.timestamp() as u32;
        let samples = [
            (METRIC_PING_AVG, stats.mean.as_secs_f64() * 1000.0),
            (METRIC_PING_MAX, stats.max.as_secs_f64() * 1000.0),
            (METRIC_PING_LOSS, stats.loss),
        ];
        for (metric, value) in samples {
            let mut wsp = self.open_metric(device.addr, metric)?;
            wsp.update(timestamp, if value.is_finite() { value } else { 0.0 })?;
        }
        Ok(())
    }

    /// Read the three ping series over the trailing `window` and zip them
    /// point by point. Unset slots stay zero.
    pub fn read_performance_pings(
        &self,
        device: &Device,
        window: std::time::Duration,
    ) -> Result<Vec<PerformancePoint>, StoreError> {
        platform_supported()?;
        let until = Utc::now().timestamp() as u32;
        let from = until.saturating_sub(window.as_secs() as u32);

        let avg = self.open_metric(device.addr, METRIC_PING_AVG)?.fetch(from, until)?;
        let max = self.open_metric(device.addr, METRIC_PING_MAX)?.fetch(from, until)?;
        let loss = self.open_metric(device.addr, METRIC_PING_LOSS)?.fetch(from, until)?;

        if avg.len() != max.len() {
            return Err(StoreError::SeriesLengthMismatch(avg.len(), max.len()));
        }
        if avg.len() != loss.len() {
            return Err(StoreError::SeriesLengthMismatch(avg.len(), loss.len()));
        }

        let mut points = Vec::with_capacity(avg.len());
        for (slot, (timestamp, avg_value)) in avg.points().enumerate() {
            let start = Utc
                .timestamp_opt(i64::from(timestamp), 0)
                .single()
                .unwrap_or_else(Utc::now);
            let max_value = max.values[slot];
            let loss_value = loss.values[slot];
            points.push(PerformancePoint {
                device: device.addr,
                start,
                average: if avg_value.is_nan() { 0.0 } else { avg_value },
                maximum: if max_value.is_nan() { 0.0 } else { max_value },
                loss: if loss_value.is_nan() { 0.0 } else { loss_value * 100.0 },
            });
        }
        Ok(points)
    }

    fn open_metric(&self, addr: IpAddr, metric: &str) -> Result<Whisper, StoreError> {
        let path = self.metric_path(addr, metric);
        Whisper::open_or_create(
            &path,
            &self.retentions,
            Aggregation::Average,
            WHISPER_X_FILES_FACTOR,
        )
    }

    fn metric_path(&self, addr: IpAddr, metric: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{}.wsp", sanitize_addr(addr), metric))
    }

    fn persist_networks(&self) -> Result<(), StoreError> {
        persist_snapshot(&self.dir.join(NETWORKS_SNAPSHOT), &self.networks)
    }

    fn persist_devices(&self) -> Result<(), StoreError> {
        persist_snapshot(&self.dir.join(DEVICES_SNAPSHOT), &self.devices)
    }
}

/// Runtime capability probe; the store has no windows implementation.
fn platform_supported() -> Result<(), StoreError> {
    if cfg!(windows) {
        return Err(StoreError::PlatformNotSupported);
    }
    Ok(())
}

fn sanitize_addr(addr: IpAddr) -> String {
    addr.to_string().replace(['.', ':'], "-")
}

fn persist_snapshot<T: serde::Serialize>(path: &Path, items: &[T]) -> Result<(), StoreError> {
    let bytes = rmp_serde::to_vec(items)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn load_snapshot<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StoreError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_store(dir: &Path) -> ComboStore {
        ComboStore::open(&ComboStoreConfig {
            enabled: true,
            directory: dir.to_string_lossy().into_owned(),
            wsp_retention: "1m:1h,10m:3h".into(),
        })
        .unwrap()
    }

    fn network(name: &str, prefix: &str) -> Network {
        Network::new(name, prefix.parse().unwrap())
    }

    #[test]
    fn test_duplicate_network_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = test_store(dir.path());

        store.add_network(network("home", "192.168.1.0/24")).unwrap();
        let err = store
            .add_network(network("home2", "192.168.1.0/24"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NetworkExists));
        assert_eq!(store.list_networks().len(), 1);

        // a prefix containing the other's base address also collides
        let err = store
            .add_network(network("wide", "192.168.1.128/25"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NetworkExists));
    }

    #[test]
    fn test_network_update_and_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = test_store(dir.path());

        let err = store.update_network(&network("ghost", "10.0.0.0/8")).unwrap_err();
        assert!(matches!(err, StoreError::NetworkNotFound));

        store.upsert_network(network("lab", "10.0.0.0/8")).unwrap();
        assert_eq!(store.list_networks().len(), 1);

        store.upsert_network(network("lab-renamed", "10.0.0.0/8")).unwrap();
        assert_eq!(store.list_networks().len(), 1);
        assert_eq!(store.list_networks()[0].name, "lab-renamed");

        store.remove_network("10.0.0.0/8".parse().unwrap()).unwrap();
        assert!(store.list_networks().is_empty());
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = test_store(dir.path());
        let addr: IpAddr = "192.168.1.5".parse().unwrap();

        store.add_device(Device::new(addr)).unwrap();
        let err = store.add_device(Device::new(addr)).unwrap_err();
        assert!(matches!(err, StoreError::DeviceExists));
        assert_eq!(store.list_devices().len(), 1);
    }

    #[test]
    fn test_update_device_requires_dirty_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = test_store(dir.path());
        let addr: IpAddr = "192.168.1.5".parse().unwrap();
        store.add_device(Device::new(addr)).unwrap();

        // clean patch: no-op even though the name differs
        let mut patch = Device::new(addr);
        patch.meta.dns_name = "ignored.lan".into();
        store.update_device(&patch).unwrap();
        assert_eq!(store.get_device(addr).unwrap().meta.dns_name, "");

        let mut patch = Device::new(addr);
        patch.set_dns_name("printer.lan");
        store.update_device(&patch).unwrap();
        let stored = store.get_device(addr).unwrap();
        assert_eq!(stored.meta.dns_name, "printer.lan");
        assert!(!stored.updated);
    }

    #[test]
    fn test_snapshots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = test_store(dir.path());
            store.add_network(network("home", "192.168.1.0/24")).unwrap();
            let mut device = Device::new("192.168.1.9".parse().unwrap());
            device.meta.manufacturer = "Acme".into();
            store.add_device(device).unwrap();
        }
        let store = test_store(dir.path());
        assert_eq!(store.list_networks().len(), 1);
        assert_eq!(store.list_devices().len(), 1);
        assert_eq!(store.list_devices()[0].meta.manufacturer, "Acme");
    }

    #[test]
    fn test_performance_ping_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let device = Device::new("192.168.1.20".parse().unwrap());

        let stats = EchoStatistics {
            count: 4,
            success_count: 4,
            min: Duration::from_millis(5),
            max: Duration::from_millis(20),
            mean: Duration::from_millis(10),
            std_dev: Duration::from_millis(2),
            loss: 0.0,
            total_elapsed: Duration::from_millis(40),
        };
        store
            .write_performance_ping(Utc::now(), &device, &stats)
            .unwrap();

        // all three metric files exist on disk
        for metric in [METRIC_PING_AVG, METRIC_PING_MAX, METRIC_PING_LOSS] {
            assert!(store.metric_path(device.addr, metric).is_file(), "{metric}");
        }
        assert!(dir
            .path()
            .join("192-168-1-20_pingavg.wsp")
            .is_file());

        let points = store
            .read_performance_pings(&device, Duration::from_secs(1800))
            .unwrap();
        assert!(!points.is_empty());
        let stored: Vec<&PerformancePoint> =
            points.iter().filter(|p| p.average > 0.0).collect();
        assert_eq!(stored.len(), 1);
        assert!((stored[0].average - 10.0).abs() < 1e-9);
        assert!((stored[0].maximum - 20.0).abs() < 1e-9);
        assert_eq!(stored[0].loss, 0.0);
        assert_eq!(stored[0].device, device.addr);
    }
}
