//! Performance pinger: periodically ping every known device and append
//! the latency/loss aggregates to its timeseries files.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{Bus, Event};
use crate::config::PingerConfig;
use crate::model::Device;
use crate::probe::{icmp, EchoOpts, Prober};
use crate::store::ComboStore;

pub struct Pinger {
    prober: Arc<Prober>,
    store: Arc<Mutex<ComboStore>>,
    bus: Bus,
    cfg: PingerConfig,
}

impl Pinger {
    pub fn new(
        prober: Arc<Prober>,
        store: Arc<Mutex<ComboStore>>,
        bus: Bus,
        cfg: PingerConfig,
    ) -> Self {
        Self {
            prober,
            store,
            bus,
            cfg,
        }
    }

    /// Ping the device table on the configured interval until cancelled.
    /// Devices are probed a batch at a time so one slow host does not
    /// stall the whole cycle.
    pub async fn run(&self, cancel: CancellationToken) {
        const BATCH_SIZE: usize = 8;
        loop {
            let devices = self.store.lock().await.list_devices().to_vec();
            for batch in devices.chunks(BATCH_SIZE) {
                if cancel.is_cancelled() {
                    return;
                }
                futures::future::join_all(
                    batch
                        .iter()
                        .map(|device| self.ping_device(&cancel, device.clone())),
                )
                .await;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.interval) => {}
            }
        }
    }

    async fn ping_device(&self, cancel: &CancellationToken, device: Device) {
        let opts = EchoOpts {
            count: self.cfg.count,
            between: self.cfg.between,
            allow_all_errors: true,
            ..EchoOpts::default()
        };
        let responses = match self.prober.icmp4_echo(cancel, device.addr, opts).await {
            Ok(responses) => responses,
            Err(e) => {
                debug!(addr = %device.addr, error = %e, "ping failed");
                return;
            }
        };
        if responses.is_empty() {
            return;
        }

        let stats = icmp::statistics(&responses);
        let now = Utc::now();
        {
            let store = self.store.lock().await;
            if let Err(e) = store.write_performance_ping(now, &device, &stats) {
                warn!(addr = %device.addr, error = %e, "failed to record ping sample");
            }
        }

        if stats.success_count > 0 {
            let mut seen = device;
            seen.mark_seen(now);
            if let Err(e) = self.store.lock().await.update_device(&seen) {
                debug!(addr = %seen.addr, error = %e, "failed to stamp last seen");
            } else {
                self.bus.publish(Event::DeviceUpdated(seen));
            }
        }
    }
}
