//! EVPN gateway daemon.
//!
//! Wires the resource store, its task manager, the linked backends and the
//! netlink synchronizer together and runs them until SIGINT/SIGTERM.

mod backends;
mod config;

use anyhow::{anyhow, Context};
use backends::{spawn_netlink_logger, LoggingBackend, ReplayReady};
use clap::Parser;
use config::{GatewayConfig, DEFAULT_CONFIG_PATH};
use evpn_common::{open_store, DeliveryPolicy, EventBus, SubscriberConfig, PRE_REPLAY};
use evpn_infradb::{spawn_handler, InfraDb};
use evpn_netlink::{IpCommandSource, NetlinkEvent, NetlinkSynchronizer, ALL_EVENTS};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "evpn-gwd", version, about = "EVPN gateway reconciliation daemon")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter, e.g. `info` or `evpn_netlink=debug`; overrides RUST_LOG
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref())?;

    info!(config = %args.config.display(), "evpn-gwd starting");
    let config = GatewayConfig::load_or_default(&args.config)?;
    config.validate()?;

    match run(config).await {
        Ok(()) => {
            info!("evpn-gwd exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "evpn-gwd exiting with error");
            Err(e)
        }
    }
}

fn init_logging(level: Option<&str>) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("invalid log level {}", level))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("cannot initialise logging: {}", e))
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let kv = open_store(config.database.backend, &config.database.address)
        .await
        .with_context(|| {
            format!(
                "cannot open {} store at {}",
                config.database.backend, config.database.address
            )
        })?;
    let (db, manager) = InfraDb::new(kv, config.backoff());
    let cancel = CancellationToken::new();
    let mut workers = vec![tokio::spawn(manager.run(cancel.clone()))];

    let mut linked = Vec::new();
    for sub in &config.subscribers {
        if !backends::is_builtin(&sub.name) {
            warn!(subscriber = %sub.name, "No backend linked for subscriber, not subscribing");
            continue;
        }
        let rx = db
            .bus()
            .subscribe(sub.subscriber_config(config.task_manager.event_queue_depth))?;
        db.actions()
            .register(PRE_REPLAY, sub.name.clone(), Arc::new(ReplayReady));
        workers.push(spawn_handler(
            db.clone(),
            sub.name.clone(),
            rx,
            Arc::new(LoggingBackend),
            cancel.clone(),
        ));
        linked.push(sub.name.clone());
    }

    // Backends start empty; let them re-learn what the store already holds.
    for name in &linked {
        match db.replay(name).await {
            Ok(count) => info!(subscriber = %name, count, "Replay complete"),
            Err(e) => warn!(subscriber = %name, error = %e, "Replay failed"),
        }
    }

    if config.netlink.enabled {
        let bus: Arc<EventBus<NetlinkEvent>> = Arc::new(EventBus::new());
        let rx = bus.subscribe(
            SubscriberConfig::new("netlink-logger")
                .with_events(ALL_EVENTS)
                .with_policy(DeliveryPolicy::DropNewest),
        )?;
        workers.push(spawn_netlink_logger(rx));
        let sync = NetlinkSynchronizer::new(
            config.netlink_config(),
            Arc::new(IpCommandSource::new()),
            db.clone(),
            bus,
        );
        workers.push(tokio::spawn(sync.run(cancel.clone())));
    } else {
        info!("Netlink synchronizer disabled");
    }

    shutdown_signal().await;
    cancel.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker terminated abnormally");
        }
    }
    info!("Graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
