//! Cleanup manager for storage management
//!
//! Handles automatic deletion of old recordings and enforces disk quotas.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use sysinfo::Disks;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::dvr::database::DvrDatabase;
use crate::dvr::manager::RecorderManager;
use crate::dvr::models::{now_ms, DiskInfo, RecordedId};
use crate::dvr::store::RecordingStore;

/// Cleanup interval (1 hour)
const CLEANUP_INTERVAL_HOURS: u64 = 1;

/// Minimum free space percentage before aggressive cleanup
const MIN_FREE_SPACE_PERCENT: f64 = 10.0;

/// Manages storage cleanup
pub struct CleanupManager {
    db: Arc<DvrDatabase>,
    manager: Arc<RecorderManager>,
    default_dir: PathBuf,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupManager {
    pub fn new(db: Arc<DvrDatabase>, manager: Arc<RecorderManager>, default_dir: PathBuf) -> Self {
        Self {
            db,
            manager,
            default_dir,
            task: Mutex::new(None),
        }
    }

    /// Start periodic cleanup task
    pub fn start_periodic_cleanup(&self) {
        let db = self.db.clone();
        let manager = self.manager.clone();
        let default_dir = self.default_dir.clone();

        let task = tokio::spawn(async move {
            let mut cleanup_interval = interval(Duration::from_secs(CLEANUP_INTERVAL_HOURS * 3600));

            loop {
                cleanup_interval.tick().await;

                if let Err(e) = run_cleanup(&db, &manager, &default_dir).await {
                    error!("Cleanup failed: {}", e);
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        info!("Periodic cleanup task started (every {} hours)", CLEANUP_INTERVAL_HOURS);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("Periodic cleanup task stopped");
        }
    }

    /// Run cleanup immediately (for manual trigger)
    pub async fn run_now(&self) -> Result<()> {
        run_cleanup(&self.db, &self.manager, &self.default_dir).await
    }
}

/// Run cleanup operations
async fn run_cleanup(db: &Arc<DvrDatabase>, manager: &RecorderManager, default_dir: &Path) -> Result<()> {
    info!("Running storage cleanup...");

    let settings = db.get_settings()?;
    let storage_path = if settings.storage_path.is_empty() {
        default_dir.to_path_buf()
    } else {
        PathBuf::from(&settings.storage_path)
    };

    // Delete old recordings based on age policy
    if let Some(keep_days) = settings.keep_recordings_days {
        let deleted = delete_old_recordings(db, keep_days, now_ms()).await?;
        if deleted > 0 {
            info!("Deleted {} old recordings ({} days policy)", deleted, keep_days);
        }
    }

    let disk_info = match get_disk_info(&storage_path) {
        Ok(info) => info,
        Err(e) => {
            warn!("Skipping quota checks for {:?}: {}", storage_path, e);
            return update_recording_sizes(db).await;
        }
    };
    info!(
        "Disk usage: {:.1}% ({} GB free of {} GB)",
        disk_info.usage_percent,
        disk_info.available_bytes / 1_000_000_000,
        disk_info.total_bytes / 1_000_000_000
    );

    // Enforce disk quota if enabled
    if settings.auto_cleanup_enabled && disk_info.usage_percent > settings.max_disk_usage_percent as f64 {
        let target_usage = settings.max_disk_usage_percent as f64;
        let deleted = enforce_quota(db, &disk_info, target_usage).await?;
        if deleted > 0 {
            info!("Deleted {} recordings to enforce {:.0}% quota", deleted, target_usage);
        }
    }

    // Emergency cleanup if critically low on space
    if disk_info.usage_percent > (100.0 - MIN_FREE_SPACE_PERCENT) {
        warn!("CRITICAL: Low disk space ({:.1}% free)!", 100.0 - disk_info.usage_percent);
        let deleted = emergency_cleanup(db, manager).await?;
        if deleted > 0 {
            warn!("Emergency cleanup deleted {} recordings", deleted);
        }
    }

    update_recording_sizes(db).await?;

    info!("Storage cleanup completed");
    Ok(())
}

/// Get disk information for the disk holding `path` (longest matching mount point)
fn get_disk_info(path: &Path) -> Result<DiskInfo> {
    let disks = Disks::new_with_refreshed_list();

    let disk = disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .ok_or_else(|| anyhow::anyhow!("Could not determine disk info for {:?}", path))?;

    let total = disk.total_space();
    let available = disk.available_space();
    let used = total.saturating_sub(available);
    let percent = if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    };

    Ok(DiskInfo {
        total_bytes: total,
        available_bytes: available,
        used_bytes: used,
        usage_percent: percent,
    })
}

/// Remove a recorded item and its files. Returns the bytes freed.
async fn delete_recording(db: &DvrDatabase, id: RecordedId) -> Result<u64> {
    let size = db.recorded_size(id).unwrap_or(0).max(0) as u64;
    let paths = db.delete_recorded(id)?;

    for path in paths {
        let file_path = PathBuf::from(&path);
        if file_path.is_file() {
            if let Err(e) = tokio::fs::remove_file(&file_path).await {
                warn!("Failed to delete recording file {:?}: {}", file_path, e);
            }
        }
    }

    Ok(size)
}

/// Delete finished recordings that ended more than `max_age_days` ago
async fn delete_old_recordings(db: &DvrDatabase, max_age_days: i32, now: i64) -> Result<usize> {
    let cutoff = now - max_age_days as i64 * 24 * 3_600_000;

    let recordings = db.get_finished_recorded()?;
    let mut deleted_count = 0;

    for recording in recordings {
        if recording.end_at > cutoff {
            continue;
        }

        if let Err(e) = delete_recording(db, recording.id).await {
            warn!("Failed to delete old recording {}: {}", recording.id, e);
            continue;
        }

        deleted_count += 1;
        debug!(
            "Deleted old recording: {} (ended {})",
            recording.name,
            chrono::DateTime::from_timestamp_millis(recording.end_at)
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_default()
        );
    }

    Ok(deleted_count)
}

/// Enforce disk quota by deleting oldest finished recordings
async fn enforce_quota(db: &DvrDatabase, disk_info: &DiskInfo, target_percent: f64) -> Result<usize> {
    let target_bytes = (disk_info.total_bytes as f64 * target_percent / 100.0) as u64;
    if disk_info.used_bytes <= target_bytes {
        return Ok(0);
    }

    let bytes_to_free = disk_info.used_bytes - target_bytes;
    let mut bytes_freed: u64 = 0;

    let recordings = db.get_finished_recorded()?;
    let mut deleted_count = 0;

    for recording in recordings {
        if bytes_freed >= bytes_to_free {
            break;
        }

        match delete_recording(db, recording.id).await {
            Ok(freed) => {
                bytes_freed += freed;
                deleted_count += 1;
                debug!(
                    "Deleted recording for quota: {} (freed {} MB)",
                    recording.name,
                    freed / 1_000_000
                );
            }
            Err(e) => warn!("Failed to delete recording {}: {}", recording.id, e),
        }
    }

    Ok(deleted_count)
}

/// Emergency cleanup when critically low on space.
///
/// Deletes the oldest half of the finished recordings; with none left, the
/// oldest recording still in progress is stopped and deleted.
async fn emergency_cleanup(db: &DvrDatabase, manager: &RecorderManager) -> Result<usize> {
    let recordings = db.get_finished_recorded()?;

    if recordings.is_empty() {
        let Some(oldest) = db.get_recording_recorded()?.into_iter().next() else {
            return Ok(0);
        };

        warn!("Stopping in-progress recording {} to free space", oldest.name);
        if let Some(reservation_id) = oldest.reservation_id {
            manager.discard(reservation_id).await?;
        }
        delete_recording(db, oldest.id).await?;
        return Ok(1);
    }

    let to_delete = recordings.len().div_ceil(2);
    let mut deleted_count = 0;

    for recording in recordings.iter().take(to_delete) {
        if let Err(e) = delete_recording(db, recording.id).await {
            warn!("Emergency delete failed for {}: {}", recording.id, e);
            continue;
        }
        deleted_count += 1;
    }

    Ok(deleted_count)
}

/// Bring stored file sizes of finished recordings in line with the disk
async fn update_recording_sizes(db: &DvrDatabase) -> Result<()> {
    for recording in db.get_finished_recorded()? {
        for file in db.get_video_files(recording.id)? {
            if let Ok(metadata) = tokio::fs::metadata(&file.file_path).await {
                let size = metadata.len() as i64;
                if size != file.size_bytes {
                    if let Err(e) = db.update_video_file_size(file.id, size) {
                        warn!("Failed to update size for video file {}: {}", file.id, e);
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dvr::allocator::TunerAllocator;
    use crate::dvr::models::{ChannelType, NewRecorded};
    use crate::dvr::paths::StoragePathFormatter;
    use crate::dvr::recorder::RecorderContext;
    use crate::dvr::stream_acquirer::StreamAcquirer;
    use crate::dvr::testing::{fast_timings, test_db, FakeBackend};
    use tempfile::TempDir;

    const DAY_MS: i64 = 24 * 3_600_000;

    /// Insert a recorded item with a real file of `size` bytes
    fn add_file(db: &DvrDatabase, dir: &Path, name: &str, end_at: i64, size: usize, finished: bool) -> RecordedId {
        let path = dir.join(format!("{}.m2ts", name));
        std::fs::write(&path, vec![0x47u8; size]).unwrap();

        let (id, video_file_id) = db
            .add_recorded(&NewRecorded {
                reservation_id: 0,
                rule_id: None,
                program_id: None,
                channel_id: 1,
                name: name.to_string(),
                start_at: end_at - 1_000,
                end_at,
                file_path: path.to_string_lossy().to_string(),
            })
            .unwrap();
        db.update_video_file_size(video_file_id, size as i64).unwrap();
        if finished {
            db.finish_recording(id).unwrap();
        }
        id
    }

    fn manager(db: Arc<DvrDatabase>, storage: &Path) -> RecorderManager {
        let backend = Arc::new(FakeBackend::with_tuners(&[&[ChannelType::Terrestrial]]));
        let timings = fast_timings();
        let allocator = TunerAllocator::new(backend.tuners.clone(), backend.clone(), timings.prep_lead_ms);
        let ctx = RecorderContext {
            store: db.clone(),
            acquirer: Arc::new(StreamAcquirer::new(backend, allocator, timings.clone())),
            paths: Arc::new(StoragePathFormatter::new(db.clone(), storage.to_path_buf())),
            timings,
        };
        RecorderManager::new(db, ctx)
    }

    #[tokio::test]
    async fn test_age_policy_keeps_recent() {
        let (_db_dir, db) = test_db();
        let storage = TempDir::new().unwrap();
        let now = now_ms();

        let old = add_file(&db, storage.path(), "old", now - 40 * DAY_MS, 10, true);
        let recent = add_file(&db, storage.path(), "recent", now - DAY_MS, 10, true);

        assert_eq!(delete_old_recordings(&db, 30, now).await.unwrap(), 1);
        assert!(db.get_recorded(old).unwrap().is_none());
        assert!(db.get_recorded(recent).unwrap().is_some());
        assert!(!storage.path().join("old.m2ts").exists());
        assert!(storage.path().join("recent.m2ts").exists());
    }

    #[tokio::test]
    async fn test_quota_deletes_oldest_until_enough() {
        let (_db_dir, db) = test_db();
        let storage = TempDir::new().unwrap();
        let now = now_ms();

        let oldest = add_file(&db, storage.path(), "a", now - 3 * DAY_MS, 300, true);
        let middle = add_file(&db, storage.path(), "b", now - 2 * DAY_MS, 300, true);
        let newest = add_file(&db, storage.path(), "c", now - DAY_MS, 300, true);

        // 900 of 1000 bytes used, target 50%: 400 bytes must go
        let disk = DiskInfo {
            total_bytes: 1_000,
            available_bytes: 100,
            used_bytes: 900,
            usage_percent: 90.0,
        };
        assert_eq!(enforce_quota(&db, &disk, 50.0).await.unwrap(), 2);
        assert!(db.get_recorded(oldest).unwrap().is_none());
        assert!(db.get_recorded(middle).unwrap().is_none());
        assert!(db.get_recorded(newest).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_emergency_falls_back_to_in_progress() {
        let (_db_dir, db) = test_db();
        let db = Arc::new(db);
        let storage = TempDir::new().unwrap();
        let manager = manager(db.clone(), storage.path());
        let now = now_ms();

        let in_progress = add_file(&db, storage.path(), "live", now + DAY_MS, 10, false);

        assert_eq!(emergency_cleanup(&db, &manager).await.unwrap(), 1);
        assert!(db.get_recorded(in_progress).unwrap().is_none());
        assert!(!storage.path().join("live.m2ts").exists());
    }

    #[tokio::test]
    async fn test_sizes_follow_disk() {
        let (_db_dir, db) = test_db();
        let storage = TempDir::new().unwrap();
        let id = add_file(&db, storage.path(), "grown", now_ms(), 10, true);
        std::fs::write(storage.path().join("grown.m2ts"), vec![0u8; 64]).unwrap();

        update_recording_sizes(&db).await.unwrap();
        assert_eq!(db.recorded_size(id).unwrap(), 64);
    }
}
