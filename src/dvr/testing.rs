//! Test doubles shared by the unit tests

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::dvr::backend::{ByteStream, TunerBackend};
use crate::dvr::config::RecorderTimings;
use crate::dvr::database::DvrDatabase;
use crate::dvr::error::BackendError;
use crate::dvr::models::{ChannelType, Program, ProgramId, Reservation, ReservationStatus, TunerDevice};

/// One transport stream packet
pub const CHUNK: &[u8] = &[0x47; 188];

/// How streams handed out by `FakeBackend` behave
#[derive(Debug, Clone, Copy)]
pub enum StreamMode {
    /// A chunk every 10ms until the receiver goes away
    Pump,
    /// Stays open without ever yielding
    Silent,
    /// `n` chunks, then a natural end
    Finite(usize),
}

#[derive(Default)]
struct FakeState {
    programs: HashMap<ProgramId, Program>,
    failing_lookups: HashSet<ProgramId>,
    hanging_lookups: HashSet<ProgramId>,
    failing_streams: usize,
    mode: Option<StreamMode>,
    service_requests: Vec<i64>,
    program_requests: Vec<ProgramId>,
    last_priority: Option<i32>,
}

/// Scripted tuner backend
pub struct FakeBackend {
    pub tuners: Vec<TunerDevice>,
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn with_tuners(types: &[&[ChannelType]]) -> Self {
        let tuners = types
            .iter()
            .enumerate()
            .map(|(index, types)| TunerDevice {
                index,
                name: format!("tuner{}", index),
                types: types.to_vec(),
            })
            .collect();

        Self {
            tuners,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn set_program(&self, id: ProgramId, start_at: i64, end_at: i64) {
        self.state.lock().programs.insert(
            id,
            Program {
                id,
                channel_id: 0,
                name: format!("program {}", id),
                start_at,
                end_at,
            },
        );
    }

    pub fn fail_program_lookup(&self, id: ProgramId) {
        self.state.lock().failing_lookups.insert(id);
    }

    /// Lookups of `id` never answer
    pub fn hang_program_lookup(&self, id: ProgramId) {
        self.state.lock().hanging_lookups.insert(id);
    }

    /// The next `n` stream requests fail with a 503
    pub fn fail_next_streams(&self, n: usize) {
        self.state.lock().failing_streams = n;
    }

    pub fn set_mode(&self, mode: StreamMode) {
        self.state.lock().mode = Some(mode);
    }

    pub fn service_requests(&self) -> Vec<i64> {
        self.state.lock().service_requests.clone()
    }

    pub fn program_requests(&self) -> Vec<ProgramId> {
        self.state.lock().program_requests.clone()
    }

    pub fn last_priority(&self) -> Option<i32> {
        self.state.lock().last_priority
    }

    fn open(&self, priority: i32, cancel: &CancellationToken) -> Result<ByteStream, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let mode = {
            let mut state = self.state.lock();
            state.last_priority = Some(priority);
            if state.failing_streams > 0 {
                state.failing_streams -= 1;
                return Err(BackendError::Status {
                    status: 503,
                    message: "no tuner available".to_string(),
                });
            }
            state.mode.unwrap_or(StreamMode::Pump)
        };

        let (tx, rx) = mpsc::channel::<Bytes>(4);
        tokio::spawn(async move {
            match mode {
                StreamMode::Pump => loop {
                    if tx.send(Bytes::from_static(CHUNK)).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                },
                StreamMode::Silent => tx.closed().await,
                StreamMode::Finite(n) => {
                    for _ in 0..n {
                        if tx.send(Bytes::from_static(CHUNK)).await.is_err() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).map(Ok).boxed())
    }
}

#[async_trait]
impl TunerBackend for FakeBackend {
    async fn list_tuners(&self) -> Result<Vec<TunerDevice>, BackendError> {
        Ok(self.tuners.clone())
    }

    async fn get_program(&self, program_id: ProgramId) -> Result<Option<Program>, BackendError> {
        {
            let state = self.state.lock();
            if state.failing_lookups.contains(&program_id) {
                return Err(BackendError::Status {
                    status: 500,
                    message: "lookup failed".to_string(),
                });
            }
            if !state.hanging_lookups.contains(&program_id) {
                return Ok(state.programs.get(&program_id).cloned());
            }
        }
        std::future::pending().await
    }

    async fn program_stream(
        &self,
        program_id: ProgramId,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, BackendError> {
        self.state.lock().program_requests.push(program_id);
        self.open(priority, cancel)
    }

    async fn service_stream(
        &self,
        channel_id: i64,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, BackendError> {
        self.state.lock().service_requests.push(channel_id);
        self.open(priority, cancel)
    }
}

/// Terrestrial reservation on physical channel `channel`; `id` 0 lets the database assign one
pub fn reservation(
    id: i64,
    channel: &str,
    program_id: Option<ProgramId>,
    start_at: i64,
    end_at: i64,
) -> Reservation {
    Reservation {
        id,
        channel_id: 3_273_600_000 + channel.parse::<i64>().unwrap_or(0),
        channel_type: ChannelType::Terrestrial,
        channel: channel.to_string(),
        program_id,
        rule_id: None,
        name: format!("reservation {}", id),
        start_at,
        end_at,
        allow_end_lack: false,
        is_conflict: false,
        is_skip: false,
        is_overlap: false,
        status: ReservationStatus::Scheduled,
    }
}

/// Millisecond-scale timings so lifecycle tests finish quickly
pub fn fast_timings() -> RecorderTimings {
    RecorderTimings {
        prep_lead_ms: 100,
        max_prep_retries: 3,
        retry_backoff_ms: 20,
        first_chunk_timeout_ms: 300,
        cancel_ack_timeout_ms: 2_000,
        time_specified_start_margin_ms: 50,
        time_specified_end_margin_ms: 50,
        ..RecorderTimings::default()
    }
}

/// Fresh database in a temporary directory; keep the `TempDir` alive
pub fn test_db() -> (TempDir, DvrDatabase) {
    let temp_dir = TempDir::new().unwrap();
    let db = DvrDatabase::open(&temp_dir.path().join("test.db")).unwrap();
    (temp_dir, db)
}
