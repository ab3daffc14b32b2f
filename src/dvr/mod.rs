//! DVR (Digital Video Recorder) module
//!
//! Schedules recordings against a tuner backend: one recorder per
//! reservation, a tuner allocator that shares and preempts tuners, and the
//! persistence and housekeeping around them.

pub mod allocator;
pub mod backend;
pub mod cleanup;
pub mod config;
pub mod database;
pub mod error;
pub mod manager;
pub mod models;
pub mod paths;
pub mod recorder;
pub mod scheduler;
pub mod store;
pub mod stream_acquirer;

#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::RwLock;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use crate::dvr::allocator::TunerAllocator;
use crate::dvr::backend::{MirakurunClient, TunerBackend};
use crate::dvr::cleanup::CleanupManager;
use crate::dvr::config::DvrConfig;
use crate::dvr::database::DvrDatabase;
use crate::dvr::manager::RecorderManager;
use crate::dvr::paths::StoragePathFormatter;
use crate::dvr::recorder::RecorderContext;
use crate::dvr::scheduler::Scheduler;
use crate::dvr::stream_acquirer::StreamAcquirer;

/// Shared state for DVR operations
#[derive(Clone)]
pub struct DvrState {
    pub db: Arc<DvrDatabase>,
    pub backend: Arc<dyn TunerBackend>,
    pub allocator: TunerAllocator,
    pub manager: Arc<RecorderManager>,
    pub scheduler: Arc<RwLock<Scheduler>>,
    pub cleanup: Arc<CleanupManager>,
}

impl DvrState {
    /// Initialize the DVR system; loads the tuner list from the backend
    pub async fn new(config: &DvrConfig) -> anyhow::Result<Self> {
        info!("Initializing DVR system...");

        let db = Arc::new(DvrDatabase::open(&config.database_path)?);
        info!("DVR database initialized");

        let backend: Arc<dyn TunerBackend> = Arc::new(
            MirakurunClient::new(&config.backend_url).context("Failed to create tuner backend client")?,
        );
        let allocator = TunerAllocator::from_backend(backend.clone(), config.timings.prep_lead_ms)
            .await
            .with_context(|| format!("Failed to load tuners from {}", config.backend_url))?;
        info!("Tuner allocator initialized");

        let ctx = RecorderContext {
            store: db.clone(),
            acquirer: Arc::new(StreamAcquirer::new(
                backend.clone(),
                allocator.clone(),
                config.timings.clone(),
            )),
            paths: Arc::new(StoragePathFormatter::new(db.clone(), config.recording_dir.clone())),
            timings: config.timings.clone(),
        };
        let manager = Arc::new(RecorderManager::new(db.clone(), ctx));
        info!("Recorder manager initialized");

        let cleanup = Arc::new(CleanupManager::new(
            db.clone(),
            manager.clone(),
            config.recording_dir.clone(),
        ));
        let scheduler = Arc::new(RwLock::new(Scheduler::new(
            manager.clone(),
            allocator.clone(),
            config.timings.clone(),
        )));

        info!("DVR system initialized successfully");
        Ok(Self {
            db,
            backend,
            allocator,
            manager,
            scheduler,
            cleanup,
        })
    }

    /// Start all background tasks (scheduler, cleanup)
    pub async fn start_background_tasks(&self) -> anyhow::Result<()> {
        info!("Starting DVR background tasks...");

        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.start().await?;
        }
        info!("Scheduler started");

        self.cleanup.start_periodic_cleanup();

        info!("All DVR background tasks started");
        Ok(())
    }

    /// Stop all background tasks gracefully
    pub async fn stop(&self) {
        info!("Stopping DVR system...");

        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.stop().await;
        }
        self.cleanup.stop();

        self.manager.stop_all().await;

        info!("DVR system stopped");
    }
}

/// Initialize logging for DVR operations
///
/// When debug_logging is false, rusqlite and other verbose logs are
/// suppressed. With a log directory, output also goes to a daily rolling
/// file; keep the returned guard alive until shutdown.
pub fn init_logging(debug_logging: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = if debug_logging {
        // Show all logs including DEBUG
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info,rusqlite=warn")
    };

    let stdout = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "recsched.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .try_init();

    guard
}
