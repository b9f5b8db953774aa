use folio_sync::{EngineConfig, SyncEngine};
use log::{error, info};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = EngineConfig::from_env()?;
    info!(
        "Starting folio server on {} (storage at {})",
        config.relay.bind_addr,
        config.store.path.display()
    );
    let engine = SyncEngine::open(config)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
        }
        signal.cancel();
    });

    engine.run(shutdown).await?;
    info!("Folio server stopped");
    Ok(())
}
