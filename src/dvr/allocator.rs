//! Tuner allocator
//!
//! Owns the live view of the physical tuners and which reservations occupy
//! them. Occupancy is an explicit lease: the lease is registered before the
//! stream request goes out so concurrent decisions see the slot as taken, and
//! dropping the returned `LeaseGuard` (the stream ending) releases it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dvr::backend::TunerBackend;
use crate::dvr::models::{
    now_ms, PhysicalChannel, ProgramId, Reservation, ReservationId, TunerDevice,
};

/// One reservation streaming from one tuner
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: u64,
    pub tuner_index: usize,
    pub reservation_id: ReservationId,
    pub channel: PhysicalChannel,
    pub program_id: Option<ProgramId>,
    pub end_at: i64,
    pub allow_end_lack: bool,
    /// Destroys the occupant's stream on preemption
    kill: CancellationToken,
}

struct TunerSlot {
    device: TunerDevice,
    leases: Vec<Lease>,
}

impl TunerSlot {
    fn lease_ids(&self) -> Vec<u64> {
        self.leases.iter().map(|l| l.id).collect()
    }
}

struct AllocatorInner {
    tuners: Mutex<Vec<TunerSlot>>,
    backend: Arc<dyn TunerBackend>,
    prep_lead_ms: i64,
    next_lease_id: AtomicU64,
}

impl AllocatorInner {
    fn release(&self, lease_id: u64) {
        let mut tuners = self.tuners.lock();
        for slot in tuners.iter_mut() {
            if let Some(pos) = slot.leases.iter().position(|l| l.id == lease_id) {
                let lease = slot.leases.remove(pos);
                debug!(
                    "Released tuner {} from reservation {}",
                    lease.tuner_index, lease.reservation_id
                );
                return;
            }
        }
    }
}

/// Keeps a tuner lease alive; dropping it releases the slot
pub struct LeaseGuard {
    inner: Weak<AllocatorInner>,
    lease_id: u64,
    tuner_index: usize,
}

impl LeaseGuard {
    pub fn tuner_index(&self) -> usize {
        self.tuner_index
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.release(self.lease_id);
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("lease_id", &self.lease_id)
            .field("tuner_index", &self.tuner_index)
            .finish()
    }
}

/// Occupancy snapshot of one tuner
#[derive(Debug, Clone, serde::Serialize)]
pub struct TunerStatus {
    pub index: usize,
    pub name: String,
    pub occupants: Vec<ReservationId>,
}

#[derive(Clone)]
pub struct TunerAllocator {
    inner: Arc<AllocatorInner>,
}

impl TunerAllocator {
    pub fn new(devices: Vec<TunerDevice>, backend: Arc<dyn TunerBackend>, prep_lead_ms: u64) -> Self {
        info!("Tuner allocator managing {} tuner(s)", devices.len());
        let tuners = devices
            .into_iter()
            .map(|device| TunerSlot {
                device,
                leases: Vec::new(),
            })
            .collect();

        Self {
            inner: Arc::new(AllocatorInner {
                tuners: Mutex::new(tuners),
                backend,
                prep_lead_ms: prep_lead_ms as i64,
                next_lease_id: AtomicU64::new(1),
            }),
        }
    }

    /// Build from the tuner list the backend reports
    pub async fn from_backend(backend: Arc<dyn TunerBackend>, prep_lead_ms: u64) -> anyhow::Result<Self> {
        let devices = backend.list_tuners().await?;
        for device in &devices {
            debug!("Tuner {} '{}' types {:?}", device.index, device.name, device.types);
        }
        Ok(Self::new(devices, backend, prep_lead_ms))
    }

    /// Pick a tuner for `reservation` and register it as occupant.
    ///
    /// `kill` is the occupant's stream kill switch; a later preemption of the
    /// chosen tuner cancels it. `cancel` aborts the backend lookups made while
    /// checking preemption. `None` means no tuner could be reserved (or the
    /// search was cancelled) and the caller should fall back to best-effort
    /// acquisition.
    pub async fn assign(
        &self,
        reservation: &Reservation,
        kill: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Option<LeaseGuard> {
        let channel = reservation.physical_channel();

        // A reservation holds at most one tuner
        self.release_reservation(reservation.id);

        let candidates = {
            let mut tuners = self.inner.tuners.lock();

            // Pass 1: free tuner, or one already serving the same physical channel
            for (index, slot) in tuners.iter_mut().enumerate() {
                if !slot.device.types.contains(&channel.channel_type) {
                    continue;
                }
                if slot.leases.iter().all(|l| l.channel == channel) {
                    let shared = !slot.leases.is_empty();
                    let guard = self.register(slot, index, reservation, kill);
                    info!(
                        "Reservation {} assigned tuner {}{}",
                        reservation.id,
                        index,
                        if shared { " (shared channel)" } else { "" }
                    );
                    return Some(guard);
                }
            }

            // Pass 2 candidates: every occupant tolerates end lack and ends soon
            let now = now_ms();
            tuners
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.device.types.contains(&channel.channel_type))
                .filter(|(_, slot)| {
                    slot.leases
                        .iter()
                        .all(|l| l.allow_end_lack && l.end_at - now <= self.inner.prep_lead_ms)
                })
                .map(|(index, slot)| (index, slot.leases.clone()))
                .collect::<Vec<_>>()
        };

        for (index, occupants) in candidates {
            let not_extended = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Tuner search for reservation {} cancelled", reservation.id);
                    return None;
                }
                not_extended = self.occupants_not_extended(&occupants) => not_extended,
            };
            if !not_extended {
                debug!("Tuner {} not preemptable: occupant program extended or unknown", index);
                continue;
            }

            let mut tuners = self.inner.tuners.lock();
            let slot = &mut tuners[index];

            // Occupancy changed while we were checking; skip this tuner
            let snapshot: Vec<u64> = occupants.iter().map(|l| l.id).collect();
            if slot.lease_ids() != snapshot {
                continue;
            }

            for lease in slot.leases.drain(..) {
                warn!(
                    "Preempting tuner {}: stopping reservation {} for reservation {}",
                    index, lease.reservation_id, reservation.id
                );
                lease.kill.cancel();
            }

            let guard = self.register(slot, index, reservation, kill);
            return Some(guard);
        }

        warn!(
            "No tuner available for reservation {} ({} {})",
            reservation.id,
            channel.channel_type.as_str(),
            channel.channel
        );
        None
    }

    /// Program-bound occupants must still end when their lease says so.
    /// A failed lookup counts as extended.
    async fn occupants_not_extended(&self, occupants: &[Lease]) -> bool {
        for lease in occupants {
            let Some(program_id) = lease.program_id else {
                continue;
            };

            match self.inner.backend.get_program(program_id).await {
                Ok(Some(program)) if program.end_at <= lease.end_at => {}
                Ok(Some(program)) => {
                    info!(
                        "Program {} extended to {} (reservation {} ends {})",
                        program_id, program.end_at, lease.reservation_id, lease.end_at
                    );
                    return false;
                }
                Ok(None) => {
                    warn!("Program {} unknown to backend, keeping its tuner", program_id);
                    return false;
                }
                Err(e) => {
                    warn!("Program {} lookup failed, keeping its tuner: {}", program_id, e);
                    return false;
                }
            }
        }
        true
    }

    fn register(
        &self,
        slot: &mut TunerSlot,
        index: usize,
        reservation: &Reservation,
        kill: &CancellationToken,
    ) -> LeaseGuard {
        let lease_id = self.inner.next_lease_id.fetch_add(1, Ordering::Relaxed);
        slot.leases.push(Lease {
            id: lease_id,
            tuner_index: index,
            reservation_id: reservation.id,
            channel: reservation.physical_channel(),
            program_id: reservation.program_id,
            end_at: reservation.end_at,
            allow_end_lack: reservation.allow_end_lack,
            kill: kill.clone(),
        });

        LeaseGuard {
            inner: Arc::downgrade(&self.inner),
            lease_id,
            tuner_index: index,
        }
    }

    fn release_reservation(&self, reservation_id: ReservationId) {
        let mut tuners = self.inner.tuners.lock();
        for slot in tuners.iter_mut() {
            slot.leases.retain(|l| l.reservation_id != reservation_id);
        }
    }

    /// Track a changed end instant so preemption decisions use it
    pub fn update_end(&self, reservation_id: ReservationId, end_at: i64) {
        let mut tuners = self.inner.tuners.lock();
        for lease in tuners.iter_mut().flat_map(|slot| slot.leases.iter_mut()) {
            if lease.reservation_id == reservation_id {
                lease.end_at = end_at;
            }
        }
    }

    /// Drop leases that ended more than `max_age_hours` ago. Returns how many.
    pub fn sweep_stale(&self, now: i64, max_age_hours: i64) -> usize {
        let threshold = now - max_age_hours * 3_600_000;
        let mut removed = 0;

        let mut tuners = self.inner.tuners.lock();
        for slot in tuners.iter_mut() {
            let before = slot.leases.len();
            slot.leases.retain(|l| l.end_at >= threshold);
            removed += before - slot.leases.len();
        }

        if removed > 0 {
            warn!("Swept {} stale tuner lease(s)", removed);
        }
        removed
    }

    pub fn status(&self) -> Vec<TunerStatus> {
        let tuners = self.inner.tuners.lock();
        tuners
            .iter()
            .enumerate()
            .map(|(index, slot)| TunerStatus {
                index,
                name: slot.device.name.clone(),
                occupants: slot.leases.iter().map(|l| l.reservation_id).collect(),
            })
            .collect()
    }
}
