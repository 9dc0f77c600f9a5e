//! GridTrade marketplace node.
//!
//! Loads configuration, installs logging, wires the marketplace and runs
//! the reconciliation sweep until Ctrl-C or SIGTERM. Callbacks go to the
//! log; an HTTP front end would supply its own transport.

mod settings;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use gridtrade_protocol::{LoggingTransport, Marketplace, MarketplaceParts};
use gridtrade_types::{Result, constants};
use tokio::sync::watch;
use tracing::{info, warn};

/// How long shutdown waits for in-flight callbacks.
const CALLBACK_DRAIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = settings::load()?;
    telemetry::init(&config.logging)?;
    info!(
        name = constants::MARKETPLACE_NAME,
        version = constants::VERSION,
        currency = %config.currency.code,
        "Starting node"
    );

    let market = Marketplace::build(&config, Arc::new(LoggingTransport), MarketplaceParts::default())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = if config.reconciliation.enabled {
        Some(market.reconciler.clone().spawn(shutdown_rx))
    } else {
        info!("Reconciliation disabled");
        None
    };

    info!("Node ready");
    shutdown_signal().await;
    info!("Shutting down");

    if shutdown_tx.send(true).is_err() {
        warn!("Reconciler already stopped");
    }
    if let Some(handle) = reconciler {
        if let Err(err) = handle.await {
            warn!(error = %err, "Reconciler task failed");
        }
    }

    if !market.dispatcher.wait_idle(CALLBACK_DRAIN).await {
        warn!(in_flight = market.dispatcher.in_flight(), "Callbacks still in flight at shutdown");
    }
    let stats = market.dispatcher.stats();
    let dead = market.dispatcher.dead_letters().len();
    if dead > 0 {
        warn!(dead_letters = dead, "Undelivered callbacks at shutdown");
    }
    info!(
        scheduled = stats.scheduled,
        delivered = stats.delivered,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        "Node stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
