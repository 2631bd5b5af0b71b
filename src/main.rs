//! Cubicle node daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

mod config;
mod credentials;
mod fetcher;
mod health;
mod inspector;
mod net;
mod operations;
mod reconciler;
mod runtime;
mod types;

use config::Config;
use credentials::CredentialStore;
use fetcher::ControlPlaneClient;
use health::run_health_loop;
use inspector::Inspector;
use operations::Operations;
use reconciler::Reconciler;
use runtime::DockerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting cubicled with config: {:?}", cfg);

    let client = Arc::new(ControlPlaneClient::new(
        cfg.control_plane_url(),
        cfg.request_timeout(),
        cfg.source_address,
    )?);
    info!("Control plane at {}", client.base_url());

    // Container Runtime (Docker)
    let runtime = Arc::new(DockerRuntime::connect()?);

    let credentials = CredentialStore::new(cfg.keytab_root.clone(), cfg.domain());
    info!(
        "Managing domain {} with credentials under {}",
        credentials.domain(),
        credentials.root().display()
    );

    // Reconciler
    let operations = Operations::new(Arc::clone(&runtime), credentials, cfg.fleet_settings());
    let reconciler = Reconciler::new(Arc::clone(&client), operations, cfg.tick_interval());
    let reconciler_handle = tokio::spawn(async move {
        reconciler.run().await;
    });

    // Health reporter
    let health_handle = if cfg.health_enabled {
        let inspector = Inspector::new(Arc::clone(&runtime), cfg.managed_label.clone());
        let interval = cfg.health_interval();
        let client = Arc::clone(&client);
        Some(tokio::spawn(async move {
            run_health_loop(client, inspector, interval).await;
        }))
    } else {
        info!("Health reporting disabled");
        None
    };

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks; actual state is re-read from the runtime on next start.
    reconciler_handle.abort();
    if let Some(handle) = health_handle {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}
