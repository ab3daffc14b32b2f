//! Recording file placement
//!
//! Recordings go under the storage path from settings (or the configured
//! default) as `<start>_<channel>_<title>.m2ts`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::dvr::database::DvrDatabase;
use crate::dvr::models::Reservation;

const EXTENSION: &str = "m2ts";

/// Decides where a reservation's recording is written
pub trait PathFormatter: Send + Sync {
    /// Full path of a file that does not exist yet; parent directories are created
    fn recording_path(&self, reservation: &Reservation) -> Result<PathBuf>;
}

pub struct StoragePathFormatter {
    db: Arc<DvrDatabase>,
    default_dir: PathBuf,
}

impl StoragePathFormatter {
    pub fn new(db: Arc<DvrDatabase>, default_dir: PathBuf) -> Self {
        Self { db, default_dir }
    }

    /// Get storage path from settings
    pub fn storage_dir(&self) -> Result<PathBuf> {
        let settings = self.db.get_settings()?;

        let path = if settings.storage_path.is_empty() {
            self.default_dir.clone()
        } else {
            PathBuf::from(&settings.storage_path)
        };
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create storage directory {:?}", path))?;
        Ok(path)
    }
}

impl PathFormatter for StoragePathFormatter {
    fn recording_path(&self, reservation: &Reservation) -> Result<PathBuf> {
        let dir = self.storage_dir()?;
        let path = unique_path(&dir, &generate_stem(reservation));
        debug!("Recording path for reservation {}: {:?}", reservation.id, path);
        Ok(path)
    }
}

/// Generate the file stem for a recording
fn generate_stem(reservation: &Reservation) -> String {
    let timestamp = chrono::DateTime::from_timestamp_millis(reservation.start_at)
        .map(|dt| dt.format("%Y-%m-%dT%H-%M-%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let title: String = sanitize(&reservation.name).take(50).collect();
    let channel: String = sanitize(&reservation.channel_id.to_string()).take(30).collect();

    format!("{}_{}_{}", timestamp, channel, title)
}

// Reserved on Windows
fn sanitize(s: &str) -> impl Iterator<Item = char> + '_ {
    s.chars().map(|c| match c {
        '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
        c => c,
    })
}

/// `stem.m2ts`, or `stem (n).m2ts` with the first free `n`
fn unique_path(dir: &Path, stem: &str) -> PathBuf {
    let candidate = dir.join(format!("{}.{}", stem, EXTENSION));
    if !candidate.exists() {
        return candidate;
    }

    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{} ({}).{}", stem, n, EXTENSION));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
