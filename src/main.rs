use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tracker_core::config::Config;
use tracker_core::dispatch::Dispatcher;
use tracker_core::geocode::Geocoder;
use tracker_core::session::{SessionRegistry, SessionSettings};
use tracker_core::storage::SqliteGateway;
use tracker_core::{replay, server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;
    info!(config = ?config, "Tracker starting");

    let gateway = SqliteGateway::open(&config.db_path)?;
    let registry = SessionRegistry::new(SessionSettings {
        trip: config.trip,
        precision: config.precision,
    });
    let known = gateway.load_sessions()?;
    info!(devices = known.len(), "Restoring device sessions");
    for (device, last) in known {
        registry.restore(device, last);
    }

    let geocoder = match &config.geocoder_url {
        Some(url) => Some(Geocoder::new(url.as_str())?),
        None => None,
    };
    let (dispatch, dispatcher) = Dispatcher::spawn(gateway, geocoder, config.gateway);

    if let Some(source) = &config.replay {
        let protocol = source.protocol.parse()?;
        let report = replay::replay_file(&source.file, protocol, &registry, &dispatch).await?;
        info!(?report, "Replay complete");
    } else {
        tokio::select! {
            result = server::run(&config, registry.clone(), dispatch.clone()) => {
                if let Err(e) = result {
                    error!(error = %e, "Server stopped");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
            }
        }
    }

    let unsaved = dispatch.shutdown().await;
    if !unsaved.is_empty() {
        warn!(count = unsaved.len(), "Records not persisted at shutdown");
    }
    if let Err(e) = dispatcher.await {
        error!(error = %e, "Dispatcher task failed");
    }
    Ok(())
}
