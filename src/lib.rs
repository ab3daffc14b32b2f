//! Recording scheduler for a broadcast PVR backend

pub mod dvr;

use tracing::{error, info};

use crate::dvr::config::DvrConfig;
use crate::dvr::DvrState;

/// Run the recording service until Ctrl-C
pub async fn run() -> anyhow::Result<()> {
    let config = DvrConfig::load_default()?;
    let _log_guard = dvr::init_logging(config.debug_logging, config.log_dir.as_deref());

    info!("recsched {} starting", env!("CARGO_PKG_VERSION"));

    let state = DvrState::new(&config).await?;
    state.start_background_tasks().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutdown requested");
    state.stop().await;
    Ok(())
}
