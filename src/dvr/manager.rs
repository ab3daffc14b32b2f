//! Recorder set manager
//!
//! Owns one recorder per pending reservation, keeps the set in line with the
//! database and turns recorder events into reservation status changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::dvr::database::DvrDatabase;
use crate::dvr::models::*;
use crate::dvr::recorder::{RecorderContext, RecorderHandle, RecorderState};

/// How long `discard` and `stop_all` wait for a recorder to wind down
const SHUTDOWN_WAIT_SECS: u64 = 10;

struct Entry {
    handle: RecorderHandle,
    reservation: Reservation,
}

/// Snapshot of one managed recorder
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecorderStatus {
    pub reservation_id: ReservationId,
    pub name: String,
    pub start_at: i64,
    pub end_at: i64,
    pub state: RecorderState,
}

pub struct RecorderManager {
    db: Arc<DvrDatabase>,
    ctx: RecorderContext,
    recorders: Arc<Mutex<HashMap<ReservationId, Entry>>>,
    event_tx: mpsc::Sender<RecorderEvent>,
    broadcast_tx: broadcast::Sender<RecorderEvent>,
}

impl RecorderManager {
    /// Create a new manager and start consuming recorder events
    pub fn new(db: Arc<DvrDatabase>, ctx: RecorderContext) -> Self {
        let (event_tx, mut event_rx) = mpsc::channel::<RecorderEvent>(100);
        let (broadcast_tx, _) = broadcast::channel(100);
        let recorders: Arc<Mutex<HashMap<ReservationId, Entry>>> = Arc::new(Mutex::new(HashMap::new()));

        let event_db = db.clone();
        let event_recorders = recorders.clone();
        let event_broadcast = broadcast_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                handle_event(&event_db, &event_recorders, &event);
                // No subscribers is fine
                let _ = event_broadcast.send(event);
            }
        });

        Self {
            db,
            ctx,
            recorders,
            event_tx,
            broadcast_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Start a recorder for `reservation`. Returns whether it was armed.
    pub async fn add(&self, reservation: Reservation) -> bool {
        let id = reservation.id;
        if self.recorders.lock().contains_key(&id) {
            debug!("Reservation {} already has a recorder", id);
            return false;
        }
        if reservation.is_excluded() || reservation.end_at <= now_ms() {
            debug!("Reservation {} is not recordable, skipping", id);
            return false;
        }

        let handle = RecorderHandle::spawn(reservation.clone(), self.ctx.clone(), self.event_tx.clone());
        // Registered before arming so early events find their entry
        self.recorders.lock().insert(
            id,
            Entry {
                handle: handle.clone(),
                reservation: reservation.clone(),
            },
        );

        if !handle.arm_timer().await {
            self.recorders.lock().remove(&id);
            if let Err(e) = handle.cancel(false).await {
                error!("{}", e);
            }
            return false;
        }

        info!("Added recorder for reservation {}: {}", id, reservation.name);
        true
    }

    /// Forward a changed reservation to its recorder, or start one
    pub async fn update(&self, reservation: Reservation) -> Result<()> {
        let handle = {
            let mut recorders = self.recorders.lock();
            match recorders.get_mut(&reservation.id) {
                Some(entry) if entry.reservation == reservation => return Ok(()),
                Some(entry) => {
                    entry.reservation = reservation.clone();
                    Some(entry.handle.clone())
                }
                None => None,
            }
        };

        match handle {
            Some(handle) => handle.update(reservation).await?,
            None => {
                self.add(reservation).await;
            }
        }
        Ok(())
    }

    /// Cancel and forget the recorder of a reservation
    pub async fn remove(&self, id: ReservationId) -> Result<()> {
        let entry = self.recorders.lock().remove(&id);
        if let Some(entry) = entry {
            info!("Removing recorder for reservation {}", id);
            entry.handle.cancel(false).await?;
        }
        Ok(())
    }

    /// Cancel a recorder whose recording is about to be deleted and wait for it to finish
    pub async fn discard(&self, id: ReservationId) -> Result<()> {
        let entry = self.recorders.lock().remove(&id);
        let Some(entry) = entry else {
            return Ok(());
        };

        warn!("Discarding recording of reservation {}", id);
        entry.handle.cancel(true).await?;
        wait_closed(&entry.handle).await;
        Ok(())
    }

    /// Re-arm every recorder still waiting for its preparation timer
    pub async fn reset_timers(&self) {
        let handles: Vec<RecorderHandle> = self
            .recorders
            .lock()
            .values()
            .map(|e| e.handle.clone())
            .collect();

        for handle in handles {
            if let Err(e) = handle.reset_timer().await {
                debug!("{}", e);
            }
        }
    }

    /// Reconcile the recorder set with pending reservations in the database
    pub async fn sync(&self) -> Result<()> {
        let pending = self.db.get_pending_reservations(now_ms())?;
        let wanted: HashSet<ReservationId> = pending.iter().map(|r| r.id).collect();

        let stale: Vec<ReservationId> = {
            let mut recorders = self.recorders.lock();
            recorders.retain(|_, entry| !entry.handle.state().is_terminal());
            recorders
                .keys()
                .filter(|id| !wanted.contains(id))
                .copied()
                .collect()
        };

        for id in stale {
            if let Err(e) = self.remove(id).await {
                warn!("Failed to remove recorder {}: {}", id, e);
            }
        }

        for reservation in pending {
            if let Err(e) = self.update(reservation).await {
                warn!("Failed to sync recorder: {}", e);
            }
        }

        debug!("Recorder set synced: {} active", self.recorders.lock().len());
        Ok(())
    }

    /// Cancel every recorder and wait for them to wind down
    pub async fn stop_all(&self) {
        let entries: Vec<Entry> = self.recorders.lock().drain().map(|(_, e)| e).collect();
        info!("Stopping {} recorder(s)", entries.len());

        for entry in &entries {
            if let Err(e) = entry.handle.cancel(false).await {
                error!("{}", e);
            }
        }
        for entry in &entries {
            wait_closed(&entry.handle).await;
        }
    }

    pub fn status(&self) -> Vec<RecorderStatus> {
        let recorders = self.recorders.lock();
        let mut status: Vec<RecorderStatus> = recorders
            .values()
            .map(|entry| RecorderStatus {
                reservation_id: entry.reservation.id,
                name: entry.reservation.name.clone(),
                start_at: entry.reservation.start_at,
                end_at: entry.reservation.end_at,
                state: entry.handle.state(),
            })
            .collect();
        status.sort_by_key(|s| s.start_at);
        status
    }
}

async fn wait_closed(handle: &RecorderHandle) {
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_WAIT_SECS), handle.closed())
        .await
        .is_err()
    {
        warn!(
            "Recorder for reservation {} did not stop within {}s",
            handle.reservation_id(),
            SHUTDOWN_WAIT_SECS
        );
    }
}

/// Apply a recorder event to the reservation it belongs to
fn handle_event(
    db: &DvrDatabase,
    recorders: &Mutex<HashMap<ReservationId, Entry>>,
    event: &RecorderEvent,
) {
    let id = event.reservation_id;
    debug!("Recorder event for reservation {}: {:?}", id, event.kind);

    let result = match &event.kind {
        RecorderEventKind::RecordingStarted { .. } => {
            db.set_reservation_status(id, ReservationStatus::Recording)
        }
        RecorderEventKind::RecordingFinished {
            reservation_cleanup_needed: true,
            ..
        } => db.delete_reservation(id),
        RecorderEventKind::RecordingFinished { .. } => {
            db.set_reservation_status(id, ReservationStatus::Completed)
        }
        RecorderEventKind::PrepFailed { .. } | RecorderEventKind::RecordingFailed { .. } => {
            db.set_reservation_status(id, ReservationStatus::Failed)
        }
        RecorderEventKind::PrepCancelled {
            reason: PrepCancelReason::ProgramVanished,
        } => db.set_reservation_status(id, ReservationStatus::Canceled),
        _ => Ok(()),
    };

    if let Err(e) = result {
        error!("Failed to apply event for reservation {}: {}", id, e);
    }

    if event.kind.is_terminal() {
        let mut recorders = recorders.lock();
        // A newer recorder may already be registered under the same id
        if recorders
            .get(&id)
            .is_some_and(|entry| entry.handle.state().is_terminal())
        {
            recorders.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dvr::allocator::TunerAllocator;
    use crate::dvr::paths::{PathFormatter, StoragePathFormatter};
    use crate::dvr::stream_acquirer::StreamAcquirer;
    use crate::dvr::testing::{fast_timings, reservation, test_db, FakeBackend, StreamMode};
    use tempfile::TempDir;

    struct Fixture {
        backend: Arc<FakeBackend>,
        db: Arc<DvrDatabase>,
        manager: RecorderManager,
        _dirs: (TempDir, TempDir),
    }

    fn fixture() -> Fixture {
        fixture_with_paths(None)
    }

    fn fixture_with_paths(paths: Option<Arc<dyn PathFormatter>>) -> Fixture {
        let backend = Arc::new(FakeBackend::with_tuners(&[
            &[ChannelType::Terrestrial],
            &[ChannelType::Terrestrial],
        ]));
        let (db_dir, db) = test_db();
        let db = Arc::new(db);
        let storage = TempDir::new().unwrap();
        let timings = fast_timings();
        let paths: Arc<dyn PathFormatter> = match paths {
            Some(paths) => paths,
            None => Arc::new(StoragePathFormatter::new(db.clone(), storage.path().to_path_buf())),
        };

        let allocator = TunerAllocator::new(backend.tuners.clone(), backend.clone(), timings.prep_lead_ms);
        let ctx = RecorderContext {
            store: db.clone(),
            acquirer: Arc::new(StreamAcquirer::new(backend.clone(), allocator, timings.clone())),
            paths,
            timings,
        };
        let manager = RecorderManager::new(db.clone(), ctx);

        Fixture {
            backend,
            db,
            manager,
            _dirs: (db_dir, storage),
        }
    }

    fn insert(db: &DvrDatabase, mut r: Reservation) -> Reservation {
        r.id = db.add_reservation(&r).unwrap();
        if let Some(program_id) = r.program_id {
            db.upsert_program(&Program {
                id: program_id,
                channel_id: r.channel_id,
                name: r.name.clone(),
                start_at: r.start_at,
                end_at: r.end_at,
            })
            .unwrap();
        }
        r
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<RecorderEvent>,
        pred: impl Fn(&RecorderEvent) -> bool,
    ) -> RecorderEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_finished_recording_deletes_reservation() {
        let f = fixture();
        f.backend.set_mode(StreamMode::Finite(3));
        let mut events = f.manager.subscribe();

        let now = now_ms();
        let r = insert(&f.db, reservation(0, "27", Some(100), now, now + 60_000));
        f.manager.sync().await.unwrap();

        wait_for(&mut events, |e| {
            matches!(e.kind, RecorderEventKind::RecordingStarted { .. })
        })
        .await;
        wait_for(&mut events, |e| e.kind.is_terminal()).await;

        // The event loop applies the change right before broadcasting it
        assert!(f.db.get_reservation(r.id).unwrap().is_none());
        assert!(f.manager.status().is_empty());
    }

    #[tokio::test]
    async fn test_failed_prep_marks_reservation_failed() {
        let f = fixture();
        f.backend.fail_next_streams(100);
        let mut events = f.manager.subscribe();

        let now = now_ms();
        let r = insert(&f.db, reservation(0, "27", Some(100), now, now + 60_000));
        assert!(f.manager.add(r.clone()).await);

        wait_for(&mut events, |e| {
            matches!(e.kind, RecorderEventKind::PrepFailed { .. })
        })
        .await;
        let stored = f.db.get_reservation(r.id).unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Failed);

        // Failed reservations are no longer pending, so sync leaves them alone
        f.manager.sync().await.unwrap();
        assert!(f.manager.status().is_empty());
    }

    #[tokio::test]
    async fn test_sync_adds_updates_and_removes() {
        let f = fixture();
        let mut events = f.manager.subscribe();
        let now = now_ms();

        let a = insert(&f.db, reservation(0, "27", None, now + 60_000, now + 120_000));
        let mut skipped = reservation(0, "16", None, now + 60_000, now + 120_000);
        skipped.is_skip = true;
        insert(&f.db, skipped);

        f.manager.sync().await.unwrap();
        let status = f.manager.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].reservation_id, a.id);
        assert_eq!(status[0].state, RecorderState::Idle);

        let mut moved = a.clone();
        moved.start_at += 30_000;
        f.db.update_reservation(&moved).unwrap();
        f.manager.sync().await.unwrap();
        assert_eq!(f.manager.status()[0].start_at, moved.start_at);

        f.db.delete_reservation(a.id).unwrap();
        f.manager.sync().await.unwrap();
        assert!(f.manager.status().is_empty());
        let event = wait_for(&mut events, |e| e.reservation_id == a.id).await;
        assert_eq!(event.kind, RecorderEventKind::Cancelled);
    }

    #[tokio::test]
    async fn test_vanished_program_cancels_reservation() {
        let f = fixture();
        let mut events = f.manager.subscribe();

        let now = now_ms();
        let mut r = reservation(0, "27", Some(100), now, now + 60_000);
        r.id = f.db.add_reservation(&r).unwrap();
        f.manager.add(r.clone()).await;

        wait_for(&mut events, |e| e.kind.is_terminal()).await;
        let stored = f.db.get_reservation(r.id).unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Canceled);
    }

    #[tokio::test]
    async fn test_discard_waits_and_skips_bookkeeping() {
        let f = fixture();
        let mut events = f.manager.subscribe();

        let now = now_ms();
        let r = insert(&f.db, reservation(0, "27", Some(100), now, now + 60_000));
        f.manager.add(r.clone()).await;
        let started = wait_for(&mut events, |e| {
            matches!(e.kind, RecorderEventKind::RecordingStarted { .. })
        })
        .await;
        let RecorderEventKind::RecordingStarted { recorded_id } = started.kind else {
            unreachable!()
        };

        f.manager.discard(r.id).await.unwrap();

        let finished = wait_for(&mut events, |e| e.kind.is_terminal()).await;
        assert_eq!(
            finished.kind,
            RecorderEventKind::RecordingFinished {
                recorded_id,
                reservation_cleanup_needed: false,
            }
        );
        // Bookkeeping skipped: still flagged as recording until the caller deletes it
        assert!(f.db.get_recorded(recorded_id).unwrap().unwrap().is_recording);
    }

    #[tokio::test]
    async fn test_stop_all_and_reset_timers() {
        let f = fixture();
        let now = now_ms();
        let a = insert(&f.db, reservation(0, "27", None, now + 60_000, now + 120_000));
        let b = insert(&f.db, reservation(0, "16", Some(200), now, now + 60_000));
        f.manager.add(a).await;
        f.manager.add(b).await;

        f.manager.reset_timers().await;
        assert_eq!(f.manager.status().len(), 2);

        f.manager.stop_all().await;
        assert!(f.manager.status().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_write_failure_marks_reservation_failed() {
        struct FullDevice;
        impl PathFormatter for FullDevice {
            fn recording_path(&self, _: &Reservation) -> Result<std::path::PathBuf> {
                Ok(std::path::PathBuf::from("/dev/full"))
            }
        }

        let f = fixture_with_paths(Some(Arc::new(FullDevice)));
        let mut events = f.manager.subscribe();

        let now = now_ms();
        let r = insert(&f.db, reservation(0, "27", Some(100), now, now + 60_000));
        assert!(f.manager.add(r.clone()).await);

        let failed = wait_for(&mut events, |e| e.kind.is_terminal()).await;
        assert!(matches!(failed.kind, RecorderEventKind::RecordingFailed { .. }));

        // Left in place for inspection, not deleted like a finished recording
        let stored = f.db.get_reservation(r.id).unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Failed);
        assert!(f.manager.status().is_empty());
    }
}
