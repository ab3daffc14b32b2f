//! Stream acquirer
//!
//! Obtains a live transport stream for a reservation. Program-bound
//! reservations get the backend's per-program stream, which starts and ends
//! with the program. Wall-clock reservations get a per-service stream that is
//! drained until shortly before the configured start and force-closed after
//! the configured end.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dvr::allocator::{LeaseGuard, TunerAllocator};
use crate::dvr::backend::{ByteStream, TunerBackend};
use crate::dvr::config::RecorderTimings;
use crate::dvr::error::{AcquireError, BackendError};
use crate::dvr::models::{now_ms, Reservation};

/// Handle the recorder keeps on a stream it does not own
///
/// Created before acquisition so the end time of a wall-clock reservation can
/// be moved at any point, and so the stream can be destroyed from outside
/// (recorder cancellation or tuner preemption).
#[derive(Clone)]
pub struct StreamControl {
    kill: CancellationToken,
    end_tx: Option<Arc<watch::Sender<i64>>>,
}

impl StreamControl {
    pub fn new(reservation: &Reservation) -> Self {
        let end_tx = reservation
            .is_time_specified()
            .then(|| Arc::new(watch::channel(reservation.end_at).0));

        Self {
            kill: CancellationToken::new(),
            end_tx,
        }
    }

    /// Reschedule the force-close of a wall-clock stream
    pub fn change_end_at(&self, end_at: i64) -> Result<(), AcquireError> {
        let tx = self.end_tx.as_ref().ok_or(AcquireError::NotWallClock)?;
        tx.send_replace(end_at);
        Ok(())
    }

    pub fn destroy(&self) {
        self.kill.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.kill.is_cancelled()
    }
}

/// A live stream handed to the write pipeline
pub struct AcquiredStream {
    inner: ByteStream,
    kill: CancellationToken,
    end_rx: Option<watch::Receiver<i64>>,
    end_margin_ms: i64,
    lease: Option<LeaseGuard>,
}

impl AcquiredStream {
    pub fn tuner_index(&self) -> Option<usize> {
        self.lease.as_ref().map(|l| l.tuner_index())
    }

    /// Next chunk, or `None` once the stream ended, was destroyed, or hit its end time
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, BackendError>> {
        loop {
            let deadline = self
                .end_rx
                .as_ref()
                .map(|rx| instant_at(*rx.borrow() + self.end_margin_ms));

            let AcquiredStream {
                inner, kill, end_rx, ..
            } = &mut *self;

            tokio::select! {
                biased;
                _ = kill.cancelled() => return None,
                _ = sleep_until_opt(deadline) => {
                    debug!("Stream reached its end time");
                    return None;
                }
                _ = end_changed(end_rx) => continue,
                item = inner.next() => return item,
            }
        }
    }
}

pub struct StreamAcquirer {
    backend: Arc<dyn TunerBackend>,
    allocator: TunerAllocator,
    timings: RecorderTimings,
}

impl StreamAcquirer {
    pub fn new(backend: Arc<dyn TunerBackend>, allocator: TunerAllocator, timings: RecorderTimings) -> Self {
        Self {
            backend,
            allocator,
            timings,
        }
    }

    pub fn allocator(&self) -> &TunerAllocator {
        &self.allocator
    }

    /// Acquire a stream for `reservation`.
    ///
    /// `cancel` aborts the acquisition; `control` is the kill switch and end
    /// timer that stay attached to the returned stream.
    pub async fn acquire(
        &self,
        reservation: &Reservation,
        control: &StreamControl,
        cancel: &CancellationToken,
    ) -> Result<AcquiredStream, AcquireError> {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        // A preempted reservation must not take a tuner again
        if control.is_destroyed() {
            return Err(AcquireError::Preempted);
        }

        let lease = self.allocator.assign(reservation, &control.kill, cancel).await;
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        if lease.is_none() {
            warn!(
                "Reservation {} proceeds without a tuner reservation{}",
                reservation.id,
                if reservation.is_conflict { " (conflict)" } else { "" }
            );
        }

        let priority = self.timings.priority_for(reservation.is_conflict);
        let request = async {
            match reservation.program_id {
                Some(program_id) => self.backend.program_stream(program_id, priority, cancel).await,
                None => {
                    self.backend
                        .service_stream(reservation.channel_id, priority, cancel)
                        .await
                }
            }
        };

        let inner = tokio::select! {
            biased;
            _ = control.kill.cancelled() => return Err(AcquireError::Preempted),
            result = request => match result {
                Ok(stream) => stream,
                Err(BackendError::Cancelled) => return Err(AcquireError::Cancelled),
                Err(e) => return Err(e.into()),
            },
        };

        let mut stream = AcquiredStream {
            inner,
            kill: control.kill.clone(),
            end_rx: control.end_tx.as_ref().map(|tx| tx.subscribe()),
            end_margin_ms: self.timings.time_specified_end_margin_ms as i64,
            lease,
        };

        if reservation.is_time_specified() {
            self.drain_until_start(&mut stream, reservation, cancel).await?;
        }

        info!(
            "Stream ready for reservation {} (tuner {:?})",
            reservation.id,
            stream.tuner_index()
        );
        Ok(stream)
    }

    /// Discard bytes until `start - start_margin` so the backend keeps the
    /// stream open without us buffering it
    async fn drain_until_start(
        &self,
        stream: &mut AcquiredStream,
        reservation: &Reservation,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        let begin_at = reservation.start_at - self.timings.time_specified_start_margin_ms as i64;
        if now_ms() >= begin_at {
            return Ok(());
        }

        debug!(
            "Draining stream for reservation {} for {}ms",
            reservation.id,
            begin_at - now_ms()
        );
        let deadline = instant_at(begin_at);
        let mut discarded: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                _ = stream.kill.cancelled() => return Err(AcquireError::Preempted),
                _ = tokio::time::sleep_until(deadline) => break,
                chunk = stream.inner.next() => match chunk {
                    Some(Ok(bytes)) => discarded += bytes.len() as u64,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(AcquireError::ClosedEarly),
                },
            }
        }

        debug!("Discarded {} bytes before start of reservation {}", discarded, reservation.id);
        Ok(())
    }
}

/// Tokio instant for a Unix-ms wall-clock time; past times map to now
pub(crate) fn instant_at(at_ms: i64) -> Instant {
    let delay = (at_ms - now_ms()).max(0) as u64;
    Instant::now() + Duration::from_millis(delay)
}

pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn end_changed(end_rx: &mut Option<watch::Receiver<i64>>) {
    match end_rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                // Sender gone: the end time is final
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dvr::models::ChannelType;
    use crate::dvr::testing::{fast_timings, reservation, FakeBackend, StreamMode};

    fn acquirer(backend: Arc<FakeBackend>) -> StreamAcquirer {
        let timings = fast_timings();
        let allocator = TunerAllocator::new(backend.tuners.clone(), backend.clone(), timings.prep_lead_ms);
        StreamAcquirer::new(backend, allocator, timings)
    }

    #[tokio::test]
    async fn test_change_end_at_rejected_for_program_bound() {
        let now = now_ms();
        let program = reservation(1, "27", Some(100), now, now + 1_000);
        let control = StreamControl::new(&program);
        assert!(matches!(
            control.change_end_at(now + 2_000),
            Err(AcquireError::NotWallClock)
        ));

        let wall_clock = reservation(2, "27", None, now, now + 1_000);
        assert!(StreamControl::new(&wall_clock).change_end_at(now + 2_000).is_ok());
    }

    #[tokio::test]
    async fn test_wall_clock_drains_until_start() {
        let backend = Arc::new(FakeBackend::with_tuners(&[&[ChannelType::Terrestrial]]));
        let acquirer = acquirer(backend.clone());

        let now = now_ms();
        let wall_clock = reservation(1, "27", None, now + 300, now + 2_000);
        let control = StreamControl::new(&wall_clock);

        let mut stream = acquirer
            .acquire(&wall_clock, &control, &CancellationToken::new())
            .await
            .unwrap();

        // start margin is 50ms in the fast timings
        assert!(now_ms() >= wall_clock.start_at - 50);
        assert!(stream.next_chunk().await.unwrap().is_ok());
        assert_eq!(backend.service_requests(), vec![wall_clock.channel_id]);
    }

    #[tokio::test]
    async fn test_wall_clock_force_closes_at_moved_end() {
        let backend = Arc::new(FakeBackend::with_tuners(&[&[ChannelType::Terrestrial]]));
        let acquirer = acquirer(backend);

        let now = now_ms();
        let wall_clock = reservation(1, "27", None, now, now + 60_000);
        let control = StreamControl::new(&wall_clock);
        let mut stream = acquirer
            .acquire(&wall_clock, &control, &CancellationToken::new())
            .await
            .unwrap();

        control.change_end_at(now_ms() + 100).unwrap();
        let started = std::time::Instant::now();
        while stream.next_chunk().await.is_some() {}
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_conflict_requests_elevated_priority() {
        let backend = Arc::new(FakeBackend::with_tuners(&[&[ChannelType::Terrestrial]]));
        let acquirer = acquirer(backend.clone());

        let now = now_ms();
        let mut program = reservation(1, "27", Some(100), now, now + 60_000);
        program.is_conflict = true;
        let control = StreamControl::new(&program);
        let _stream = acquirer
            .acquire(&program, &control, &CancellationToken::new())
            .await
            .unwrap();

        let timings = fast_timings();
        assert_eq!(backend.last_priority(), Some(timings.priority_for(true)));
    }

    #[tokio::test]
    async fn test_destroy_ends_stream_and_releases_tuner() {
        let backend = Arc::new(FakeBackend::with_tuners(&[&[ChannelType::Terrestrial]]));
        let acquirer = acquirer(backend);

        let now = now_ms();
        let program = reservation(1, "27", Some(100), now, now + 60_000);
        let control = StreamControl::new(&program);
        let mut stream = acquirer
            .acquire(&program, &control, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stream.tuner_index(), Some(0));

        control.destroy();
        assert!(stream.next_chunk().await.is_none());
        drop(stream);
        assert!(acquirer.allocator().status()[0].occupants.is_empty());
    }

    #[tokio::test]
    async fn test_failed_request_releases_tuner() {
        let backend = Arc::new(FakeBackend::with_tuners(&[&[ChannelType::Terrestrial]]));
        backend.fail_next_streams(1);
        let acquirer = acquirer(backend);

        let now = now_ms();
        let program = reservation(1, "27", Some(100), now, now + 60_000);
        let result = acquirer
            .acquire(&program, &StreamControl::new(&program), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(AcquireError::Backend(_))));
        assert!(acquirer.allocator().status()[0].occupants.is_empty());
    }

    #[tokio::test]
    async fn test_destroyed_control_never_reaches_allocator() {
        let backend = Arc::new(FakeBackend::with_tuners(&[&[ChannelType::Terrestrial]]));
        let acquirer = acquirer(backend.clone());

        // A preemptable occupant that a fresh assignment would kill
        let now = now_ms();
        let mut occupant = reservation(1, "27", None, now - 60_000, now + 50);
        occupant.allow_end_lack = true;
        let occupant_kill = CancellationToken::new();
        let _lease = acquirer
            .allocator()
            .assign(&occupant, &occupant_kill, &CancellationToken::new())
            .await
            .unwrap();

        let program = reservation(2, "16", Some(200), now, now + 60_000);
        let control = StreamControl::new(&program);
        control.destroy();
        assert!(control.is_destroyed());

        let result = acquirer.acquire(&program, &control, &CancellationToken::new()).await;
        assert!(matches!(result, Err(AcquireError::Preempted)));
        assert!(!occupant_kill.is_cancelled());
        assert_eq!(acquirer.allocator().status()[0].occupants, vec![1]);
        assert!(backend.program_requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_drain() {
        let backend = Arc::new(FakeBackend::with_tuners(&[&[ChannelType::Terrestrial]]));
        backend.set_mode(StreamMode::Silent);
        let acquirer = acquirer(backend);

        let now = now_ms();
        let wall_clock = reservation(1, "27", None, now + 60_000, now + 120_000);
        let control = StreamControl::new(&wall_clock);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = acquirer.acquire(&wall_clock, &control, &cancel).await;
        assert!(matches!(result, Err(AcquireError::Cancelled)));
    }
}
