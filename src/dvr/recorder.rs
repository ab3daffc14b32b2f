//! Per-reservation recorder
//!
//! Each reservation gets one recorder task that owns its state machine:
//! it waits for the preparation timer, acquires a stream (with retries),
//! pipes it into the destination file and does the bookkeeping when the
//! stream ends. The owner talks to it through a `RecorderHandle` and hears
//! back through the shared event channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dvr::config::RecorderTimings;
use crate::dvr::error::{AcquireError, RecorderError};
use crate::dvr::models::*;
use crate::dvr::paths::PathFormatter;
use crate::dvr::store::RecordingStore;
use crate::dvr::stream_acquirer::{instant_at, sleep_until_opt, AcquiredStream, StreamAcquirer, StreamControl};

/// Collaborators shared by every recorder
#[derive(Clone)]
pub struct RecorderContext {
    pub store: Arc<dyn RecordingStore>,
    pub acquirer: Arc<StreamAcquirer>,
    pub paths: Arc<dyn PathFormatter>,
    pub timings: RecorderTimings,
}

/// Recorder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    Preparing,
    Active,
    Finished,
    CancelledBeforePrep,
    CancelledDuringPrep,
    CancelledDuringRecording,
    FailedPermanently,
}

impl RecorderState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            RecorderState::Idle | RecorderState::Preparing | RecorderState::Active
        )
    }

    pub fn can_transition_to(&self, next: RecorderState) -> bool {
        use RecorderState::*;
        matches!(
            (self, next),
            (Idle, Preparing)
                | (Idle, CancelledBeforePrep)
                | (Preparing, Idle)
                | (Preparing, Active)
                | (Preparing, CancelledDuringPrep)
                | (Preparing, FailedPermanently)
                | (Active, Finished)
                | (Active, CancelledDuringRecording)
                | (Active, FailedPermanently)
        )
    }
}

enum Command {
    ArmTimer {
        reply: oneshot::Sender<bool>,
    },
    Update {
        reservation: Reservation,
        reply: oneshot::Sender<()>,
    },
    Cancel {
        plan_to_delete: bool,
        reply: oneshot::Sender<Result<(), RecorderError>>,
    },
    ResetTimer {
        reply: oneshot::Sender<()>,
    },
}

/// Owner-side handle to a running recorder
#[derive(Clone)]
pub struct RecorderHandle {
    reservation_id: ReservationId,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<RecorderState>,
}

impl RecorderHandle {
    /// Start the recorder task in `Idle`; nothing happens until `arm_timer`
    pub fn spawn(reservation: Reservation, ctx: RecorderContext, events: mpsc::Sender<RecorderEvent>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(RecorderState::Idle);
        let reservation_id = reservation.id;

        let actor = Recorder {
            control: StreamControl::new(&reservation),
            reservation,
            ctx,
            events,
            commands: commands_rx,
            state_tx,
            state: RecorderState::Idle,
            timer: None,
            prep: None,
            active: None,
            stop_reason: None,
            cancel_requested: false,
            plan_to_delete: false,
            closing: false,
        };
        tokio::spawn(actor.run());

        Self {
            reservation_id,
            commands: commands_tx,
            state: state_rx,
        }
    }

    pub fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }

    pub fn state(&self) -> RecorderState {
        *self.state.borrow()
    }

    /// Schedule preparation. `false` when the reservation is not armed.
    pub async fn arm_timer(&self) -> bool {
        self.request(|reply| Command::ArmTimer { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn update(&self, reservation: Reservation) -> Result<(), RecorderError> {
        self.request(|reply| Command::Update { reservation, reply }).await
    }

    /// Cancel the recording. Calling it again, or on a finished recorder, is a no-op.
    pub async fn cancel(&self, plan_to_delete: bool) -> Result<(), RecorderError> {
        match self
            .request(|reply| Command::Cancel {
                plan_to_delete,
                reply,
            })
            .await
        {
            Ok(result) => result,
            Err(RecorderError::Gone(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn reset_timer(&self) -> Result<(), RecorderError> {
        self.request(|reply| Command::ResetTimer { reply }).await
    }

    /// Resolves once the recorder reached a terminal state
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RecorderError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| RecorderError::Gone(self.reservation_id))?;
        rx.await.map_err(|_| RecorderError::Gone(self.reservation_id))
    }
}

/// Why an in-flight preparation is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancel,
    Rearm,
}

struct PrepRun {
    cancel: CancellationToken,
    task: JoinHandle<PrepOutcome>,
}

struct ActiveRun {
    recorded_id: RecordedId,
    video_file_id: VideoFileId,
    file_path: PathBuf,
    task: JoinHandle<WriteOutcome>,
}

/// A stream that produced data and has a persisted recorded item
struct StartedRecording {
    stream: AcquiredStream,
    file: tokio::fs::File,
    file_path: PathBuf,
    recorded_id: RecordedId,
    video_file_id: VideoFileId,
}

enum PrepOutcome {
    Started(StartedRecording),
    Cancelled,
    ReservationDeleted,
    ProgramVanished,
    Failed(String),
}

enum WriteOutcome {
    Ended,
    WriteFailed(std::io::Error),
}

struct Recorder {
    reservation: Reservation,
    ctx: RecorderContext,
    events: mpsc::Sender<RecorderEvent>,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<RecorderState>,
    state: RecorderState,
    /// Preparation deadline while `Idle`
    timer: Option<Instant>,
    prep: Option<PrepRun>,
    active: Option<ActiveRun>,
    control: StreamControl,
    stop_reason: Option<StopReason>,
    /// Cancelled while recording: the reservation needs no separate cleanup
    cancel_requested: bool,
    plan_to_delete: bool,
    /// All handles dropped; wind down and exit
    closing: bool,
}

impl Recorder {
    async fn run(mut self) {
        debug!("Recorder for reservation {} started", self.reservation.id);

        while !self.state.is_terminal() {
            tokio::select! {
                command = self.commands.recv(), if !self.closing => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("All handles to reservation {} dropped", self.reservation.id);
                        self.closing = true;
                        if let Err(e) = self.cancel(false).await {
                            error!("{}", e);
                        }
                    }
                },
                _ = sleep_until_opt(self.timer), if self.timer.is_some() => {
                    self.timer = None;
                    self.start_prep().await;
                }
                outcome = join_prep(&mut self.prep), if self.prep.is_some() => {
                    self.prep = None;
                    self.on_prep_outcome(flatten_prep(outcome)).await;
                }
                outcome = join_active(&mut self.active), if self.active.is_some() => {
                    let outcome = outcome.unwrap_or_else(|e| {
                        WriteOutcome::WriteFailed(std::io::Error::other(e.to_string()))
                    });
                    self.terminate(outcome).await;
                }
            }
        }

        debug!(
            "Recorder for reservation {} exited in {:?}",
            self.reservation.id, self.state
        );
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::ArmTimer { reply } => {
                let armed = self.arm();
                let _ = reply.send(armed);
            }
            Command::Update { reservation, reply } => {
                self.update(reservation).await;
                let _ = reply.send(());
            }
            Command::Cancel {
                plan_to_delete,
                reply,
            } => {
                self.plan_to_delete |= plan_to_delete;
                let result = self.cancel(plan_to_delete).await;
                let _ = reply.send(result);
            }
            Command::ResetTimer { reply } => {
                self.reset_timer();
                let _ = reply.send(());
            }
        }
    }

    fn transition(&mut self, next: RecorderState) -> bool {
        if !self.state.can_transition_to(next) {
            error!(
                "Reservation {}: invalid recorder transition {:?} -> {:?}",
                self.reservation.id, self.state, next
            );
            return false;
        }

        debug!(
            "Reservation {}: {:?} -> {:?}",
            self.reservation.id, self.state, next
        );
        self.state = next;
        self.state_tx.send_replace(next);
        true
    }

    async fn emit(&self, kind: RecorderEventKind) {
        let event = RecorderEvent {
            reservation_id: self.reservation.id,
            kind,
        };
        if self.events.send(event).await.is_err() {
            debug!("Event receiver gone for reservation {}", self.reservation.id);
        }
    }

    /// Arm the preparation timer. Only possible while `Idle`.
    fn arm(&mut self) -> bool {
        if self.state != RecorderState::Idle {
            debug!(
                "Reservation {} not armed: recorder is {:?}",
                self.reservation.id, self.state
            );
            return false;
        }

        if self.reservation.is_excluded() {
            info!(
                "Reservation {} not armed: marked skip/overlap",
                self.reservation.id
            );
            self.timer = None;
            return false;
        }

        let now = now_ms();
        if self.reservation.end_at <= now {
            info!("Reservation {} not armed: already ended", self.reservation.id);
            self.timer = None;
            return false;
        }

        let prep_at = self.reservation.start_at - self.ctx.timings.prep_lead_ms as i64;
        debug!(
            "Reservation {} armed, preparing in {}ms",
            self.reservation.id,
            (prep_at - now).max(0)
        );
        self.timer = Some(instant_at(prep_at));
        true
    }

    async fn start_prep(&mut self) {
        if !self.transition(RecorderState::Preparing) {
            return;
        }

        info!(
            "Preparing recording for reservation {}: {}",
            self.reservation.id, self.reservation.name
        );

        self.control = StreamControl::new(&self.reservation);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(prepare(
            self.reservation.clone(),
            self.ctx.clone(),
            self.control.clone(),
            cancel.clone(),
        ));
        self.prep = Some(PrepRun { cancel, task });

        self.emit(RecorderEventKind::PrepStarted).await;
    }

    async fn on_prep_outcome(&mut self, outcome: PrepOutcome) {
        let stop_reason = self.stop_reason.take();
        let id = self.reservation.id;

        match outcome {
            PrepOutcome::Started(started) => {
                if !self.transition(RecorderState::Active) {
                    return;
                }

                info!(
                    "Recording started for reservation {} -> {:?}",
                    id, started.file_path
                );
                let recorded_id = started.recorded_id;
                self.active = Some(ActiveRun {
                    recorded_id,
                    video_file_id: started.video_file_id,
                    file_path: started.file_path,
                    task: tokio::spawn(write_stream(id, started.stream, started.file)),
                });
                self.emit(RecorderEventKind::RecordingStarted { recorded_id }).await;

                // Stop raced with the first chunk
                if stop_reason == Some(StopReason::Cancel) {
                    self.cancel_requested = true;
                    self.control.destroy();
                }
            }
            PrepOutcome::Cancelled if stop_reason == Some(StopReason::Rearm) => {
                self.transition(RecorderState::Idle);
                if !self.arm() {
                    self.transition(RecorderState::CancelledBeforePrep);
                    self.emit(RecorderEventKind::Cancelled).await;
                }
            }
            PrepOutcome::Cancelled => {
                info!("Preparation for reservation {} cancelled", id);
                self.transition(RecorderState::CancelledDuringPrep);
                self.emit(RecorderEventKind::PrepCancelled {
                    reason: PrepCancelReason::Requested,
                })
                .await;
            }
            PrepOutcome::ReservationDeleted => {
                info!("Reservation {} deleted during preparation", id);
                self.transition(RecorderState::CancelledDuringPrep);
                self.emit(RecorderEventKind::PrepCancelled {
                    reason: PrepCancelReason::ReservationDeleted,
                })
                .await;
            }
            PrepOutcome::ProgramVanished => {
                info!("Program of reservation {} is gone, not recording", id);
                self.transition(RecorderState::CancelledDuringPrep);
                self.emit(RecorderEventKind::PrepCancelled {
                    reason: PrepCancelReason::ProgramVanished,
                })
                .await;
            }
            PrepOutcome::Failed(reason) => {
                error!("Preparation failed for reservation {}: {}", id, reason);
                self.transition(RecorderState::FailedPermanently);
                self.emit(RecorderEventKind::PrepFailed { reason }).await;
            }
        }
    }

    /// Abort the in-flight preparation and wait (bounded) for it to acknowledge
    async fn stop_prep(&mut self, reason: StopReason) -> Result<(), RecorderError> {
        let Some(mut run) = self.prep.take() else {
            return Ok(());
        };

        self.stop_reason = Some(reason);
        run.cancel.cancel();

        match tokio::time::timeout(self.ctx.timings.cancel_ack_timeout(), &mut run.task).await {
            Ok(joined) => {
                self.on_prep_outcome(flatten_prep(joined)).await;
                Ok(())
            }
            Err(_) => {
                error!(
                    "Reservation {}: preparation did not acknowledge cancellation within {:?}",
                    self.reservation.id,
                    self.ctx.timings.cancel_ack_timeout()
                );
                run.task.abort();
                self.stop_reason = None;
                self.transition(RecorderState::CancelledDuringPrep);
                self.emit(RecorderEventKind::PrepCancelled {
                    reason: PrepCancelReason::Requested,
                })
                .await;
                Err(RecorderError::CancelAckTimeout(self.reservation.id))
            }
        }
    }

    async fn cancel(&mut self, plan_to_delete: bool) -> Result<(), RecorderError> {
        info!(
            "Cancelling reservation {} in {:?}{}",
            self.reservation.id,
            self.state,
            if plan_to_delete { " (to be deleted)" } else { "" }
        );

        match self.state {
            RecorderState::Idle => {
                self.timer = None;
                self.transition(RecorderState::CancelledBeforePrep);
                self.emit(RecorderEventKind::Cancelled).await;
                Ok(())
            }
            RecorderState::Preparing => self.stop_prep(StopReason::Cancel).await,
            RecorderState::Active => {
                // Termination follows through the write task ending
                self.cancel_requested = true;
                self.control.destroy();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn update(&mut self, reservation: Reservation) {
        let previous = std::mem::replace(&mut self.reservation, reservation);
        let id = self.reservation.id;

        if self.reservation.is_excluded() {
            info!("Reservation {} is now skip/overlap", id);
            if let Err(e) = self.cancel(false).await {
                error!("{}", e);
            }
            return;
        }

        if let Some(active) = &self.active {
            if let Err(e) = self
                .ctx
                .store
                .update_recorded_metadata(active.recorded_id, &self.reservation)
            {
                warn!("Failed to sync recorded {}: {}", active.recorded_id, e);
            }
        }

        if !self.reservation.timing_changed(&previous) {
            return;
        }

        info!(
            "Reservation {} rescheduled: {}..{} -> {}..{}",
            id, previous.start_at, previous.end_at, self.reservation.start_at, self.reservation.end_at
        );

        if matches!(self.state, RecorderState::Preparing | RecorderState::Active) {
            self.ctx
                .acquirer
                .allocator()
                .update_end(id, self.reservation.end_at);
        }

        match self.state {
            RecorderState::Idle => {
                self.arm();
            }
            RecorderState::Preparing | RecorderState::Active if self.reservation.is_time_specified() => {
                if let Err(e) = self.control.change_end_at(self.reservation.end_at) {
                    warn!("Reservation {}: cannot move end time: {}", id, e);
                }
            }
            RecorderState::Preparing if self.reservation.start_at > previous.start_at => {
                if let Err(e) = self.stop_prep(StopReason::Rearm).await {
                    error!("{}", e);
                }
            }
            _ => debug!(
                "Reservation {}: schedule change ignored in {:?}",
                id, self.state
            ),
        }
    }

    fn reset_timer(&mut self) {
        match self.state {
            RecorderState::Idle => {
                self.arm();
            }
            RecorderState::Preparing => {
                debug!("Reservation {}: preparation in flight, timer left alone", self.reservation.id);
            }
            _ => {}
        }
    }

    /// The write pipeline is done: bookkeeping, final state and notification
    async fn terminate(&mut self, outcome: WriteOutcome) {
        let Some(run) = self.active.take() else {
            return;
        };
        let id = self.reservation.id;

        let failure = match outcome {
            WriteOutcome::Ended => None,
            WriteOutcome::WriteFailed(e) => {
                error!("Write failed for reservation {}: {}", id, e);
                Some(e.to_string())
            }
        };

        if self.plan_to_delete {
            info!("Reservation {} is being deleted, skipping bookkeeping", id);
        } else {
            self.bookkeep(&run).await;
        }

        match failure {
            Some(reason) => {
                self.transition(RecorderState::FailedPermanently);
                self.emit(RecorderEventKind::RecordingFailed {
                    recorded_id: run.recorded_id,
                    reason,
                })
                .await;
            }
            None => {
                let next = if self.cancel_requested {
                    RecorderState::CancelledDuringRecording
                } else {
                    RecorderState::Finished
                };
                self.transition(next);
                info!("Recording finished for reservation {} ({:?})", id, next);
                self.emit(RecorderEventKind::RecordingFinished {
                    recorded_id: run.recorded_id,
                    reservation_cleanup_needed: !self.cancel_requested && !self.plan_to_delete,
                })
                .await;
            }
        }
    }

    async fn bookkeep(&self, run: &ActiveRun) {
        let store = &self.ctx.store;

        if let Err(e) = store.finish_recording(run.recorded_id) {
            warn!("Failed to clear recording flag of {}: {}", run.recorded_id, e);
        }

        let size = regular_file_size(&run.file_path).await;
        if let Err(e) = store.update_video_file_size(run.video_file_id, size as i64) {
            warn!("Failed to update size of video file {}: {}", run.video_file_id, e);
        }

        match store.drop_log(run.recorded_id) {
            Ok(Some(summary)) => {
                if let Err(e) = store.apply_drop_log(run.recorded_id, &summary) {
                    warn!("Failed to apply drop log of {}: {}", run.recorded_id, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to read drop log of {}: {}", run.recorded_id, e),
        }

        if let (Some(rule_id), Some(program_id)) = (self.reservation.rule_id, self.reservation.program_id) {
            let entry = HistoryEntry {
                rule_id,
                program_id,
                name: self.reservation.name.clone(),
                channel_id: self.reservation.channel_id,
                end_at: self.reservation.end_at,
            };
            if let Err(e) = store.add_history(&entry) {
                warn!("Failed to add history for reservation {}: {}", self.reservation.id, e);
            }
        }
    }
}

async fn join_prep(prep: &mut Option<PrepRun>) -> Result<PrepOutcome, JoinError> {
    match prep {
        Some(run) => (&mut run.task).await,
        None => std::future::pending().await,
    }
}

async fn join_active(active: &mut Option<ActiveRun>) -> Result<WriteOutcome, JoinError> {
    match active {
        Some(run) => (&mut run.task).await,
        None => std::future::pending().await,
    }
}

fn flatten_prep(joined: Result<PrepOutcome, JoinError>) -> PrepOutcome {
    joined.unwrap_or_else(|e| PrepOutcome::Failed(format!("preparation task failed: {}", e)))
}

/// Acquire a stream and start writing it, retrying acquisition errors
async fn prepare(
    reservation: Reservation,
    ctx: RecorderContext,
    control: StreamControl,
    cancel: CancellationToken,
) -> PrepOutcome {
    if let Some(program_id) = reservation.program_id {
        match ctx.store.get_program(program_id) {
            Ok(Some(_)) => {}
            Ok(None) => return PrepOutcome::ProgramVanished,
            Err(e) => warn!("Program cache lookup for {} failed: {}", program_id, e),
        }
    }

    let attempts = ctx.timings.max_prep_retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::select! {
                _ = cancel.cancelled() => return PrepOutcome::Cancelled,
                _ = tokio::time::sleep(ctx.timings.retry_backoff()) => {}
            }
        }

        let error = match ctx.acquirer.acquire(&reservation, &control, &cancel).await {
            Ok(stream) => {
                match ctx.store.reservation_exists(reservation.id) {
                    Ok(true) => {}
                    Ok(false) => return PrepOutcome::ReservationDeleted,
                    Err(e) => warn!("Existence check for reservation {} failed: {}", reservation.id, e),
                }

                match begin_writing(&reservation, &ctx, stream, &control, &cancel).await {
                    Ok(started) => return PrepOutcome::Started(started),
                    Err(BeginError::Cancelled) => return PrepOutcome::Cancelled,
                    Err(BeginError::Fatal(reason)) => return PrepOutcome::Failed(reason),
                    Err(BeginError::Stream(e)) => e,
                }
            }
            Err(AcquireError::Cancelled) => return PrepOutcome::Cancelled,
            Err(e) => e,
        };

        if !error.is_retryable() {
            return PrepOutcome::Failed(error.to_string());
        }
        warn!(
            "Acquisition attempt {}/{} for reservation {} failed: {}",
            attempt, attempts, reservation.id, error
        );
        last_error = error.to_string();
    }

    PrepOutcome::Failed(format!(
        "acquisition failed after {} attempts: {}",
        attempts, last_error
    ))
}

enum BeginError {
    Cancelled,
    /// Retryable like any acquisition error
    Stream(AcquireError),
    Fatal(String),
}

/// Open the destination, wait for the first chunk, then persist the recorded item
async fn begin_writing(
    reservation: &Reservation,
    ctx: &RecorderContext,
    mut stream: AcquiredStream,
    control: &StreamControl,
    cancel: &CancellationToken,
) -> Result<StartedRecording, BeginError> {
    let file_path = ctx
        .paths
        .recording_path(reservation)
        .map_err(|e| BeginError::Fatal(format!("no recording path: {:#}", e)))?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&file_path)
        .await
        .map_err(|e| BeginError::Fatal(format!("cannot open {:?}: {}", file_path, e)))?;

    let timeout = ctx.timings.first_chunk_timeout();
    let first = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        first = tokio::time::timeout(timeout, stream.next_chunk()) => Some(first),
    };

    let first = match first {
        None => {
            remove_partial(&file_path).await;
            return Err(BeginError::Cancelled);
        }
        Some(Err(_)) => {
            warn!(
                "No data for reservation {} within {:?}",
                reservation.id, timeout
            );
            remove_partial(&file_path).await;
            return Err(BeginError::Fatal(format!("no data within {:?}", timeout)));
        }
        Some(Ok(None)) => {
            remove_partial(&file_path).await;
            // Preempted before any data: not retried
            let error = if control.is_destroyed() {
                AcquireError::Preempted
            } else {
                AcquireError::ClosedEarly
            };
            return Err(BeginError::Stream(error));
        }
        Some(Ok(Some(Err(e)))) => {
            remove_partial(&file_path).await;
            return Err(BeginError::Stream(e.into()));
        }
        Some(Ok(Some(Ok(bytes)))) => bytes,
    };

    if let Err(e) = file.write_all(&first).await {
        remove_partial(&file_path).await;
        return Err(BeginError::Fatal(format!("write to {:?} failed: {}", file_path, e)));
    }

    if cancel.is_cancelled() {
        remove_partial(&file_path).await;
        return Err(BeginError::Cancelled);
    }

    let recorded = NewRecorded {
        reservation_id: reservation.id,
        rule_id: reservation.rule_id,
        program_id: reservation.program_id,
        channel_id: reservation.channel_id,
        name: reservation.name.clone(),
        start_at: reservation.start_at,
        end_at: reservation.end_at,
        file_path: file_path.to_string_lossy().to_string(),
    };
    let (recorded_id, video_file_id) = match ctx.store.add_recorded(&recorded) {
        Ok(ids) => ids,
        Err(e) => {
            remove_partial(&file_path).await;
            return Err(BeginError::Fatal(format!("failed to persist recorded item: {:#}", e)));
        }
    };

    Ok(StartedRecording {
        stream,
        file,
        file_path,
        recorded_id,
        video_file_id,
    })
}

/// Pipe the stream into the file until it ends or a write fails
async fn write_stream(
    reservation_id: ReservationId,
    mut stream: AcquiredStream,
    mut file: tokio::fs::File,
) -> WriteOutcome {
    let mut written: u64 = 0;

    loop {
        match stream.next_chunk().await {
            Some(Ok(bytes)) => {
                if let Err(e) = file.write_all(&bytes).await {
                    return WriteOutcome::WriteFailed(e);
                }
                written += bytes.len() as u64;
            }
            Some(Err(e)) => {
                warn!("Stream error for reservation {}, ending: {}", reservation_id, e);
                break;
            }
            None => break,
        }
    }

    if let Err(e) = file.flush().await {
        return WriteOutcome::WriteFailed(e);
    }

    debug!("Stream for reservation {} ended after {} bytes", reservation_id, written);
    WriteOutcome::Ended
}

async fn regular_file_size(path: &Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    }
}

/// Remove a partially written recording; only regular files are touched
async fn remove_partial(path: &Path) {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!("Failed to remove partial recording {:?}: {}", path, e);
            }
        }
        _ => {}
    }
}
