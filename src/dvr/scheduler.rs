//! Background jobs
//!
//! Periodically reconciles recorders with the reservations in the database
//! and sweeps stale tuner leases. Uses tokio-cron-scheduler for efficient job
//! scheduling.

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::dvr::allocator::TunerAllocator;
use crate::dvr::config::RecorderTimings;
use crate::dvr::manager::RecorderManager;
use crate::dvr::models::now_ms;

/// Runs the recorder sync and the lease sweep
pub struct Scheduler {
    manager: Arc<RecorderManager>,
    allocator: TunerAllocator,
    timings: RecorderTimings,
    scheduler: Option<JobScheduler>,
    is_running: bool,
}

impl Scheduler {
    pub fn new(manager: Arc<RecorderManager>, allocator: TunerAllocator, timings: RecorderTimings) -> Self {
        Self {
            manager,
            allocator,
            timings,
            scheduler: None,
            is_running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// Start the background jobs; the first sync runs immediately
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.is_running {
            warn!("Scheduler already running");
            return Ok(());
        }

        info!(
            "Starting scheduler (sync every {}s, lease sweep every {}s)",
            self.timings.sync_interval_secs, self.timings.sweep_interval_secs
        );

        let sched = JobScheduler::new().await?;

        let manager = self.manager.clone();
        let sync_job = Job::new_repeated_async(
            Duration::from_secs(self.timings.sync_interval_secs),
            move |_uuid, _l| {
                let manager = manager.clone();
                Box::pin(async move {
                    if let Err(e) = manager.sync().await {
                        error!("Error syncing recorders: {}", e);
                    }
                })
            },
        )?;
        sched.add(sync_job).await?;

        let allocator = self.allocator.clone();
        let stale_hours = self.timings.stale_lease_hours;
        let sweep_job = Job::new_repeated_async(
            Duration::from_secs(self.timings.sweep_interval_secs),
            move |_uuid, _l| {
                let allocator = allocator.clone();
                Box::pin(async move {
                    allocator.sweep_stale(now_ms(), stale_hours);
                })
            },
        )?;
        sched.add(sweep_job).await?;

        // Run initial sync immediately
        if let Err(e) = self.manager.sync().await {
            error!("Error in initial sync: {}", e);
        }

        sched.start().await?;

        self.scheduler = Some(sched);
        self.is_running = true;

        info!("Scheduler started successfully");
        Ok(())
    }

    pub async fn stop(&mut self) {
        if !self.is_running {
            return;
        }

        info!("Stopping scheduler");

        if let Some(mut sched) = self.scheduler.take() {
            if let Err(e) = sched.shutdown().await {
                error!("Error shutting down scheduler: {}", e);
            }
        }

        self.is_running = false;
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dvr::paths::StoragePathFormatter;
    use crate::dvr::recorder::RecorderContext;
    use crate::dvr::stream_acquirer::StreamAcquirer;
    use crate::dvr::testing::{fast_timings, reservation, test_db, FakeBackend};
    use crate::dvr::models::ChannelType;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_runs_initial_sync_and_stops() {
        let backend = Arc::new(FakeBackend::with_tuners(&[&[ChannelType::Terrestrial]]));
        let (_db_dir, db) = test_db();
        let db = Arc::new(db);
        let storage = TempDir::new().unwrap();
        let timings = fast_timings();

        let allocator = TunerAllocator::new(backend.tuners.clone(), backend.clone(), timings.prep_lead_ms);
        let ctx = RecorderContext {
            store: db.clone(),
            acquirer: Arc::new(StreamAcquirer::new(backend, allocator.clone(), timings.clone())),
            paths: Arc::new(StoragePathFormatter::new(db.clone(), storage.path().to_path_buf())),
            timings: timings.clone(),
        };
        let manager = Arc::new(RecorderManager::new(db.clone(), ctx));

        let now = now_ms();
        db.add_reservation(&reservation(0, "27", None, now + 60_000, now + 120_000))
            .unwrap();

        let mut scheduler = Scheduler::new(manager.clone(), allocator, timings);
        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());
        assert_eq!(manager.status().len(), 1);

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        manager.stop_all().await;
    }
}
