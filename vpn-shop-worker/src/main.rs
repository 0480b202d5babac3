//! VPN shop worker: runs the payment reconciliation loops.
//!
//! The configuration path comes from `VPN_SHOP_CONFIG` (default
//! `vpn-shop.toml`). Secrets are read from the environment variables the
//! configuration names. The worker stops on Ctrl+C or SIGTERM.

#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from sqlx and reqwest"
)]

mod observability;
mod wiring;

use std::{process::ExitCode, sync::Arc};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vpn_shop_core::{
    Result,
    config::{ShopConfig, resolve_env},
    purchase::PgStore,
    reconcile::{Reconciler, spawn_periodic},
};

use crate::observability::{LogFormat, init_observability};

const CONFIG_ENV: &str = "VPN_SHOP_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "vpn-shop.toml";

#[tokio::main]
async fn main() -> ExitCode {
    init_observability(LogFormat::from_env());

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
    let config = ShopConfig::from_file(&path)?;
    info!(config = %path, "configuration loaded");

    let store = PgStore::connect(&resolve_env(&config.database_url_env)?).await?;
    store.migrate().await?;

    let service = wiring::build_service(&config, Arc::new(store)).await?;
    let reconciler = Reconciler::new(service);

    let cancel = CancellationToken::new();
    let loops: Vec<_> = config
        .poll_targets()
        .into_iter()
        .map(|(provider, settings)| {
            spawn_periodic(reconciler.clone(), provider, settings, cancel.child_token())
        })
        .collect();
    if loops.is_empty() {
        warn!("no pollable provider enabled, waiting for shutdown");
    }

    shutdown_signal().await;
    cancel.cancel();
    for handle in loops {
        if let Err(e) = handle.await {
            error!(error = %e, "reconciliation loop panicked");
        }
    }
    info!("worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
