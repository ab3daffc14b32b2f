//! Error types at the seams where callers match on the cause

use thiserror::Error;

use crate::dvr::models::ReservationId;

/// Errors from the tuner backend service
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request cancelled")]
    Cancelled,
}

/// Errors while obtaining a live stream for a reservation
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("acquisition cancelled")]
    Cancelled,

    #[error("stream was destroyed while acquiring")]
    Preempted,

    #[error("stream closed before recording start")]
    ClosedEarly,

    #[error("end time can only be changed for wall-clock reservations")]
    NotWallClock,
}

impl AcquireError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, AcquireError::Backend(_) | AcquireError::ClosedEarly)
    }
}

/// Errors surfaced by the recorder handle itself
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder for reservation {0} is gone")]
    Gone(ReservationId),

    /// The prepare path never acknowledged a cancellation. Indicates a bug.
    #[error("reservation {0}: prepare did not acknowledge cancellation in time")]
    CancelAckTimeout(ReservationId),
}
