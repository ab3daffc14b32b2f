//! Data models for DVR operations

use serde::{Deserialize, Serialize};

pub type ReservationId = i64;
pub type ProgramId = i64;
pub type RecordedId = i64;
pub type VideoFileId = i64;

/// Current time as Unix epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Broadcast channel type served by a tuner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    #[serde(rename = "GR")]
    Terrestrial,
    #[serde(rename = "BS")]
    Satellite,
    #[serde(rename = "CS")]
    Communication,
    #[serde(rename = "SKY")]
    Sky,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Terrestrial => "GR",
            ChannelType::Satellite => "BS",
            ChannelType::Communication => "CS",
            ChannelType::Sky => "SKY",
        }
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GR" => Ok(ChannelType::Terrestrial),
            "BS" => Ok(ChannelType::Satellite),
            "CS" => Ok(ChannelType::Communication),
            "SKY" => Ok(ChannelType::Sky),
            _ => Err(format!("Unknown channel type: {}", s)),
        }
    }
}

/// Status of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Scheduled,
    Recording,
    Completed,
    Failed,
    Canceled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Scheduled => "scheduled",
            ReservationStatus::Recording => "recording",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Failed => "failed",
            ReservationStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ReservationStatus::Scheduled),
            "recording" => Ok(ReservationStatus::Recording),
            "completed" => Ok(ReservationStatus::Completed),
            "failed" => Ok(ReservationStatus::Failed),
            "canceled" => Ok(ReservationStatus::Canceled),
            _ => Err(format!("Unknown reservation status: {}", s)),
        }
    }
}

/// A scheduled recording intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    /// Service identity on the tuner backend
    pub channel_id: i64,
    pub channel_type: ChannelType,
    /// Physical channel (transponder / frequency label)
    pub channel: String,
    /// None for wall-clock reservations
    pub program_id: Option<ProgramId>,
    pub rule_id: Option<i64>,
    pub name: String,
    pub start_at: i64, // Unix ms
    pub end_at: i64,   // Unix ms
    pub allow_end_lack: bool,
    pub is_conflict: bool,
    pub is_skip: bool,
    pub is_overlap: bool,
    pub status: ReservationStatus,
}

impl Reservation {
    pub fn is_time_specified(&self) -> bool {
        self.program_id.is_none()
    }

    /// Reservations flagged skip or overlap are never executed
    pub fn is_excluded(&self) -> bool {
        self.is_skip || self.is_overlap
    }

    pub fn timing_changed(&self, other: &Reservation) -> bool {
        self.start_at != other.start_at || self.end_at != other.end_at
    }

    /// Physical channel identity used for tuner sharing
    pub fn physical_channel(&self) -> PhysicalChannel {
        PhysicalChannel {
            channel_type: self.channel_type,
            channel: self.channel.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhysicalChannel {
    pub channel_type: ChannelType,
    pub channel: String,
}

/// A program entry from the local schedule cache or the tuner backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub channel_id: i64,
    pub name: String,
    pub start_at: i64,
    pub end_at: i64,
}

/// A physical capture device reported by the tuner backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerDevice {
    pub index: usize,
    pub name: String,
    pub types: Vec<ChannelType>,
}

/// Data needed to insert a recorded item and its video file row
#[derive(Debug, Clone)]
pub struct NewRecorded {
    pub reservation_id: ReservationId,
    pub rule_id: Option<i64>,
    pub program_id: Option<ProgramId>,
    pub channel_id: i64,
    pub name: String,
    pub start_at: i64,
    pub end_at: i64,
    pub file_path: String,
}

/// A persisted recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recorded {
    pub id: RecordedId,
    pub reservation_id: Option<ReservationId>,
    pub rule_id: Option<i64>,
    pub program_id: Option<ProgramId>,
    pub channel_id: i64,
    pub name: String,
    pub start_at: i64,
    pub end_at: i64,
    pub is_recording: bool,
    pub error_cnt: i64,
    pub drop_cnt: i64,
    pub scrambling_cnt: i64,
    pub created_at: i64,
}

/// Video file row belonging to a recorded item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFile {
    pub id: VideoFileId,
    pub recorded_id: RecordedId,
    pub file_path: String,
    pub size_bytes: i64,
}

/// Counters produced by the drop-packet analysis collaborator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropLogSummary {
    pub error_cnt: i64,
    pub drop_cnt: i64,
    pub scrambling_cnt: i64,
}

/// Entry used by rule-based reservation to avoid recording duplicates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub rule_id: i64,
    pub program_id: ProgramId,
    pub name: String,
    pub channel_id: i64,
    pub end_at: i64,
}

/// Settings for DVR operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DvrSettings {
    pub storage_path: String,
    pub max_disk_usage_percent: u8,
    pub auto_cleanup_enabled: bool,
    pub keep_recordings_days: Option<i32>,
}

impl Default for DvrSettings {
    fn default() -> Self {
        Self {
            storage_path: String::new(),
            max_disk_usage_percent: 80,
            auto_cleanup_enabled: true,
            keep_recordings_days: Some(30),
        }
    }
}

/// Disk usage information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub usage_percent: f64,
}

/// Why a preparation ended without a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepCancelReason {
    Requested,
    ReservationDeleted,
    ProgramVanished,
}

/// Lifecycle notification emitted by a recorder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum RecorderEventKind {
    PrepStarted,
    PrepFailed {
        reason: String,
    },
    PrepCancelled {
        reason: PrepCancelReason,
    },
    /// Timer cleared before preparation began
    Cancelled,
    RecordingStarted {
        recorded_id: RecordedId,
    },
    RecordingFinished {
        recorded_id: RecordedId,
        reservation_cleanup_needed: bool,
    },
    RecordingFailed {
        recorded_id: RecordedId,
        reason: String,
    },
}

impl RecorderEventKind {
    /// True for notifications after which the recorder is gone
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            RecorderEventKind::PrepStarted | RecorderEventKind::RecordingStarted { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecorderEvent {
    pub reservation_id: ReservationId,
    #[serde(flatten)]
    pub kind: RecorderEventKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_terminality() {
        assert!(!RecorderEventKind::PrepStarted.is_terminal());
        assert!(!RecorderEventKind::RecordingStarted { recorded_id: 1 }.is_terminal());
        assert!(RecorderEventKind::Cancelled.is_terminal());
        assert!(RecorderEventKind::RecordingFinished {
            recorded_id: 1,
            reservation_cleanup_needed: true,
        }
        .is_terminal());
    }

    #[test]
    fn test_channel_type_round_trip() {
        for ty in [
            ChannelType::Terrestrial,
            ChannelType::Satellite,
            ChannelType::Communication,
            ChannelType::Sky,
        ] {
            assert_eq!(ty.as_str().parse::<ChannelType>().unwrap(), ty);
        }
        assert!("CATV".parse::<ChannelType>().is_err());
    }

    #[test]
    fn test_channel_type_serde_uses_backend_names() {
        let types: Vec<ChannelType> = serde_json::from_str(r#"["GR","BS"]"#).unwrap();
        assert_eq!(types, vec![ChannelType::Terrestrial, ChannelType::Satellite]);
    }
}
