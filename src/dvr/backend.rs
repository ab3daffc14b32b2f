//! Tuner backend client
//!
//! The tuner backend is an HTTP service owning the capture devices. It lists
//! tuners, serves decoded transport streams per program or per service, and
//! answers program lookups against its own (fresher) schedule.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dvr::error::BackendError;
use crate::dvr::models::{ChannelType, Program, ProgramId, TunerDevice};

/// Live transport stream body
pub type ByteStream = BoxStream<'static, Result<Bytes, BackendError>>;

/// Header carrying the request priority
const PRIORITY_HEADER: &str = "X-Mirakurun-Priority";

/// Upper bound for a program lookup; a timed out lookup is a failed one
const LOOKUP_TIMEOUT_SECS: u64 = 10;

#[async_trait]
pub trait TunerBackend: Send + Sync {
    async fn list_tuners(&self) -> Result<Vec<TunerDevice>, BackendError>;

    /// Current boundaries of a program; `None` when the backend no longer knows it
    async fn get_program(&self, program_id: ProgramId) -> Result<Option<Program>, BackendError>;

    /// Decoded stream of a single program; ends when the program ends
    async fn program_stream(
        &self,
        program_id: ProgramId,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, BackendError>;

    /// Decoded stream of a service with no end of its own
    async fn service_stream(
        &self,
        channel_id: i64,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, BackendError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TunerResponse {
    index: usize,
    name: String,
    types: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgramResponse {
    id: ProgramId,
    service_id: i64,
    start_at: i64,
    duration: i64,
    #[serde(default)]
    name: Option<String>,
}

/// HTTP client for a Mirakurun-compatible tuner server
pub struct MirakurunClient {
    base_url: String,
    client: reqwest::Client,
}

impl MirakurunClient {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn open_stream(
        &self,
        url: String,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, BackendError> {
        debug!("Requesting stream {} (priority {})", url, priority);

        let request = self
            .client
            .get(&url)
            .query(&[("decode", "1")])
            .header(PRIORITY_HEADER, priority.to_string())
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            response = request => response?,
        };

        let response = check_status(response).await?;
        info!("Stream opened: {}", url);

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(BackendError::from))
            .boxed())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl TunerBackend for MirakurunClient {
    async fn list_tuners(&self) -> Result<Vec<TunerDevice>, BackendError> {
        let response = self.client.get(self.url("/tuners")).send().await?;
        let tuners: Vec<TunerResponse> = check_status(response).await?.json().await?;

        Ok(tuners
            .into_iter()
            .map(|tuner| TunerDevice {
                index: tuner.index,
                name: tuner.name,
                types: parse_channel_types(&tuner.types),
            })
            .collect())
    }

    async fn get_program(&self, program_id: ProgramId) -> Result<Option<Program>, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("/programs/{}", program_id)))
            .timeout(Duration::from_secs(LOOKUP_TIMEOUT_SECS))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let program: ProgramResponse = check_status(response).await?.json().await?;
        Ok(Some(Program {
            id: program.id,
            channel_id: program.service_id,
            name: program.name.unwrap_or_default(),
            start_at: program.start_at,
            end_at: program.start_at + program.duration,
        }))
    }

    async fn program_stream(
        &self,
        program_id: ProgramId,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, BackendError> {
        let url = self.url(&format!("/programs/{}/stream", program_id));
        self.open_stream(url, priority, cancel).await
    }

    async fn service_stream(
        &self,
        channel_id: i64,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, BackendError> {
        let url = self.url(&format!("/services/{}/stream", channel_id));
        self.open_stream(url, priority, cancel).await
    }
}

/// Types this crate has no notion of are dropped, not fatal
fn parse_channel_types<S: AsRef<str>>(labels: &[S]) -> Vec<ChannelType> {
    labels.iter().filter_map(|l| l.as_ref().parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_response_end_is_start_plus_duration() {
        let raw = r#"{"id":1234,"eventId":1,"serviceId":1024,"networkId":32736,
                      "startAt":1700000000000,"duration":1800000,"name":"News"}"#;
        let program: ProgramResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(program.start_at + program.duration, 1_700_001_800_000);
        assert_eq!(program.service_id, 1024);
    }

    #[test]
    fn test_unknown_channel_types_are_dropped() {
        let types = parse_channel_types(&["GR", "BS", "NW"]);
        assert_eq!(types, vec![ChannelType::Terrestrial, ChannelType::Satellite]);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = MirakurunClient::new("http://localhost:40772/").unwrap();
        assert_eq!(client.url("/tuners"), "http://localhost:40772/api/tuners");
    }
}
