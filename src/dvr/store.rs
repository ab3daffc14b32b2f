//! Persistence operations the recorder depends on

use anyhow::Result;

use crate::dvr::models::{
    DropLogSummary, HistoryEntry, NewRecorded, Program, ProgramId, RecordedId, Reservation,
    ReservationId, VideoFileId,
};

/// Short, self-contained reads and writes; nothing is held across an acquisition
pub trait RecordingStore: Send + Sync {
    fn reservation_exists(&self, id: ReservationId) -> Result<bool>;

    /// Lookup in the local schedule cache
    fn get_program(&self, id: ProgramId) -> Result<Option<Program>>;

    /// Insert a recorded item (flagged as recording) and its video file row
    fn add_recorded(&self, recorded: &NewRecorded) -> Result<(RecordedId, VideoFileId)>;

    /// Copy name and rule linkage of an updated reservation onto its recording
    fn update_recorded_metadata(&self, id: RecordedId, reservation: &Reservation) -> Result<()>;

    /// Clear the "currently recording" flag
    fn finish_recording(&self, id: RecordedId) -> Result<()>;

    fn update_video_file_size(&self, id: VideoFileId, size_bytes: i64) -> Result<()>;

    /// Counters written by the drop-analysis collaborator, if any
    fn drop_log(&self, id: RecordedId) -> Result<Option<DropLogSummary>>;

    fn apply_drop_log(&self, id: RecordedId, summary: &DropLogSummary) -> Result<()>;

    fn add_history(&self, entry: &HistoryEntry) -> Result<()>;
}
