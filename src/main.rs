mod bus;
mod config;
mod enrich;
mod error;
mod model;
mod pinger;
mod pool;
mod probe;
mod refdb;
mod store;
mod sweep;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{Bus, Event};
use crate::config::Config;
use crate::enrich::{EnrichDeviceRequest, Enricher, EnrichmentWorker};
use crate::model::Network;
use crate::pinger::Pinger;
use crate::probe::Prober;
use crate::refdb::{AsnDb, NullAsnStore, OuiDb};
use crate::store::ComboStore;
use crate::sweep::Sweeper;

/// How often the dispatcher re-checks the device table for stale scans.
const ENRICHMENT_TICK: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "mason")]
#[command(about = "LAN inventory and monitoring service")]
struct Args {
    /// Configuration file (defaults to mason.* in the working directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the store data directory
    #[arg(long)]
    data_dir: Option<String>,

    /// Networks to manage, as name=cidr or bare cidr (repeatable)
    #[arg(short, long = "network")]
    networks: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mason=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = args.data_dir {
        cfg.store.combo.directory = dir;
    }
    cfg.networks.extend(args.networks);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    // Reference databases load before anything probes; a build failure
    // here aborts startup.
    let asn = if cfg.asn.enabled {
        Arc::new(
            AsnDb::load(&cancel, &cfg.asn, &NullAsnStore)
                .await
                .context("loading asn database")?,
        )
    } else {
        Arc::new(AsnDb::empty())
    };
    let oui = if cfg.oui.enabled {
        Arc::new(OuiDb::load(&cfg.oui).await.context("loading oui database")?)
    } else {
        Arc::new(OuiDb::empty())
    };
    tracing::info!(asn = asn.len(), oui = oui.len(), "reference databases ready");

    let prober = Arc::new(Prober::new().context("building interface tables")?);
    let store = Arc::new(Mutex::new(
        ComboStore::open(&cfg.store.combo).context("opening combo store")?,
    ));
    let bus = Bus::default();

    seed_networks(&cfg.networks, &store, &bus).await?;

    let mut tasks = Vec::new();

    if cfg.enrichment.enabled {
        let enricher = Arc::new(
            Enricher::new(
                Arc::clone(&prober),
                Arc::clone(&oui),
                Arc::clone(&asn),
                cfg.enrichment.clone(),
            )
            .context("building enricher")?,
        );
        let worker = EnrichmentWorker::new(enricher, cfg.enrichment.max_workers);
        let (request_tx, request_rx) = mpsc::channel(cfg.enrichment.max_workers.max(1));
        let mut handles = worker.run(cancel.clone(), request_rx);

        // dispatcher: new discoveries enrich immediately, the rest age
        // in on the tick via the scan filter
        {
            let store = Arc::clone(&store);
            let bus_rx = bus.subscribe();
            let enrichment_cfg = cfg.enrichment.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                dispatch_enrichment(cancel, store, bus_rx, enrichment_cfg, request_tx).await;
            }));
        }

        // consumer: merge enriched devices back into the store
        {
            let store = Arc::clone(&store);
            let bus = bus.clone();
            tasks.push(tokio::spawn(async move {
                let mut output_open = true;
                let mut errors_open = true;
                while output_open || errors_open {
                    tokio::select! {
                        device = handles.output.recv(), if output_open => match device {
                            Some(device) => {
                                let result = store.lock().await.update_device(&device);
                                match result {
                                    Ok(()) => bus.publish(Event::DeviceUpdated(device)),
                                    Err(e) => {
                                        tracing::warn!(addr = %device.addr, error = %e, "failed to store enrichment");
                                    }
                                }
                            }
                            None => output_open = false,
                        },
                        err = handles.errors.recv(), if errors_open => match err {
                            Some(e) => tracing::warn!(error = %e, "enrichment failed"),
                            None => errors_open = false,
                        },
                    }
                }
                let _ = handles.done.await;
            }));
        }
    }

    if cfg.discovery.enabled {
        let sweeper = Sweeper::new(
            Arc::clone(&prober),
            Arc::clone(&store),
            bus.clone(),
            cfg.discovery.clone(),
        );
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { sweeper.run(cancel).await }));
    }

    if cfg.pinger.enabled {
        let pinger = Pinger::new(
            Arc::clone(&prober),
            Arc::clone(&store),
            bus.clone(),
            cfg.pinger.clone(),
        );
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { pinger.run(cancel).await }));
    }

    {
        let store = store.lock().await;
        tracing::info!(
            networks = store.list_networks().len(),
            devices = store.list_devices().len(),
            "mason running"
        );
    }

    cancel.cancelled().await;
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("mason stopped");
    Ok(())
}

/// Merge configured networks into the store. `name=cidr` names the
/// network; a bare `cidr` names it after itself.
async fn seed_networks(
    specs: &[String],
    store: &Arc<Mutex<ComboStore>>,
    bus: &Bus,
) -> anyhow::Result<()> {
    for spec in specs {
        let (name, prefix) = match spec.split_once('=') {
            Some((name, prefix)) => (name.trim(), prefix.trim()),
            None => (spec.trim(), spec.trim()),
        };
        let prefix = prefix
            .parse()
            .with_context(|| format!("invalid network {spec:?}"))?;
        let network = Network::new(name, prefix);
        let mut store = store.lock().await;
        match store.upsert_network(network.clone()) {
            Ok(()) => bus.publish(Event::NetworkAdded(network)),
            Err(e) => tracing::warn!(network = %spec, error = %e, "failed to seed network"),
        }
    }
    Ok(())
}

/// Feed the enrichment pool: immediately for fresh discoveries, on a
/// timer for devices whose port scan has gone stale. Dropping the
/// request sender on cancellation drains and stops the pool.
async fn dispatch_enrichment(
    cancel: CancellationToken,
    store: Arc<Mutex<ComboStore>>,
    mut bus_rx: tokio::sync::broadcast::Receiver<Event>,
    cfg: crate::config::EnrichmentConfig,
    request_tx: mpsc::Sender<EnrichDeviceRequest>,
) {
    let scan_stale = enrich::port_scanner_filter(&cfg.portscan);
    let mut tick = tokio::time::interval(ENRICHMENT_TICK);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = bus_rx.recv() => {
                let device = match event {
                    Ok(Event::DeviceDiscovered(device)) => device,
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "enrichment dispatcher lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let fresh = {
                    let mut store = store.lock().await;
                    let known = store.get_device(device.addr).is_some();
                    if let Err(e) = store.upsert_device(device.clone()) {
                        tracing::warn!(addr = %device.addr, error = %e, "failed to store discovery");
                        continue;
                    }
                    !known
                };
                if fresh {
                    let request = EnrichDeviceRequest::from_config(device, &cfg);
                    if request_tx.send(request).await.is_err() {
                        break;
                    }
                }
            }
            _ = tick.tick() => {
                let stale: Vec<_> = store
                    .lock()
                    .await
                    .list_devices()
                    .iter()
                    .filter(|d| scan_stale(d))
                    .cloned()
                    .collect();
                for device in stale {
                    let request = EnrichDeviceRequest::from_config(device, &cfg);
                    if request_tx.send(request).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
