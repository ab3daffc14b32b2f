//! Database operations for DVR
//!
//! Uses rusqlite with connection pooling (r2d2) for efficient concurrent access.
//! WAL mode is enabled for concurrent reads/writes with other processes
//! (the reservation planner and the API layer share this file).

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::dvr::models::*;
use crate::dvr::store::RecordingStore;

/// Database connection pool for DVR operations
pub struct DvrDatabase {
    pool: Pool<SqliteConnectionManager>,
}

impl DvrDatabase {
    /// Open (or create) the database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("Initializing DVR database at: {:?}", db_path);

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let manager = SqliteConnectionManager::file(db_path);

        let pool = Pool::builder()
            .max_size(5) // Max 5 concurrent connections
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)
            .context("Failed to create database pool")?;

        let db = Self { pool };
        db.initialize_schema()?;
        db.configure_wal_mode()?;

        info!("DVR database initialized successfully");
        Ok(db)
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("Failed to get database connection")
    }

    /// Initialize database schema
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reservations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id INTEGER NOT NULL,
                channel_type TEXT NOT NULL,
                channel TEXT NOT NULL,
                program_id INTEGER,
                rule_id INTEGER,
                name TEXT NOT NULL,
                start_at INTEGER NOT NULL,
                end_at INTEGER NOT NULL,
                allow_end_lack INTEGER NOT NULL DEFAULT 0,
                is_conflict INTEGER NOT NULL DEFAULT 0,
                is_skip INTEGER NOT NULL DEFAULT 0,
                is_overlap INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'scheduled',
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS programs (
                id INTEGER PRIMARY KEY,
                channel_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                start_at INTEGER NOT NULL,
                end_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recorded (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                reservation_id INTEGER,
                rule_id INTEGER,
                program_id INTEGER,
                channel_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                start_at INTEGER NOT NULL,
                end_at INTEGER NOT NULL,
                is_recording INTEGER NOT NULL DEFAULT 1,
                error_cnt INTEGER NOT NULL DEFAULT 0,
                drop_cnt INTEGER NOT NULL DEFAULT 0,
                scrambling_cnt INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS video_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_id INTEGER NOT NULL,
                file_path TEXT NOT NULL UNIQUE,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (recorded_id) REFERENCES recorded(id)
            );

            CREATE TABLE IF NOT EXISTS recorded_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id INTEGER NOT NULL,
                program_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                channel_id INTEGER NOT NULL,
                end_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS drop_logs (
                recorded_id INTEGER PRIMARY KEY,
                error_cnt INTEGER NOT NULL DEFAULT 0,
                drop_cnt INTEGER NOT NULL DEFAULT 0,
                scrambling_cnt INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS dvr_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reservations_status ON reservations(status);
            CREATE INDEX IF NOT EXISTS idx_reservations_time ON reservations(start_at, end_at);
            CREATE INDEX IF NOT EXISTS idx_recorded_reservation ON recorded(reservation_id);
            CREATE INDEX IF NOT EXISTS idx_video_files_recorded ON video_files(recorded_id);
            CREATE INDEX IF NOT EXISTS idx_history_rule ON recorded_history(rule_id);",
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Configure WAL mode for concurrent access
    fn configure_wal_mode(&self) -> Result<()> {
        let conn = self.get_conn()?;

        // PRAGMA journal_mode returns the new mode, so we use query_row
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

        info!("Database journal mode: {}", journal_mode);

        if journal_mode != "wal" {
            warn!("WAL mode not enabled, got: {}", journal_mode);
        }
        Ok(())
    }

    /// Insert a reservation; the `id` field is ignored
    pub fn add_reservation(&self, reservation: &Reservation) -> Result<ReservationId> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT INTO reservations (
                channel_id, channel_type, channel, program_id, rule_id, name,
                start_at, end_at, allow_end_lack, is_conflict, is_skip, is_overlap,
                status, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                reservation.channel_id,
                reservation.channel_type.as_str(),
                reservation.channel,
                reservation.program_id,
                reservation.rule_id,
                reservation.name,
                reservation.start_at,
                reservation.end_at,
                reservation.allow_end_lack,
                reservation.is_conflict,
                reservation.is_skip,
                reservation.is_overlap,
                reservation.status.as_str(),
                now_ms(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        info!("Added reservation {}: {}", id, reservation.name);
        Ok(id)
    }

    /// Overwrite every column of an existing reservation
    pub fn update_reservation(&self, reservation: &Reservation) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "UPDATE reservations SET
                channel_id = ?1, channel_type = ?2, channel = ?3, program_id = ?4,
                rule_id = ?5, name = ?6, start_at = ?7, end_at = ?8,
                allow_end_lack = ?9, is_conflict = ?10, is_skip = ?11, is_overlap = ?12,
                status = ?13, updated_at = ?14
             WHERE id = ?15",
            params![
                reservation.channel_id,
                reservation.channel_type.as_str(),
                reservation.channel,
                reservation.program_id,
                reservation.rule_id,
                reservation.name,
                reservation.start_at,
                reservation.end_at,
                reservation.allow_end_lack,
                reservation.is_conflict,
                reservation.is_skip,
                reservation.is_overlap,
                reservation.status.as_str(),
                now_ms(),
                reservation.id,
            ],
        )?;

        debug!("Updated reservation {}", reservation.id);
        Ok(())
    }

    /// Update reservation status
    pub fn set_reservation_status(&self, id: ReservationId, status: ReservationStatus) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "UPDATE reservations SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_ms(), id],
        )?;

        debug!("Updated reservation {} to {:?}", id, status);
        Ok(())
    }

    pub fn delete_reservation(&self, id: ReservationId) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM reservations WHERE id = ?1", params![id])?;

        info!("Deleted reservation {}", id);
        Ok(())
    }

    /// Get reservation by ID
    pub fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let conn = self.get_conn()?;

        let reservation = conn
            .query_row(
                "SELECT * FROM reservations WHERE id = ?1",
                params![id],
                reservation_from_row,
            )
            .optional()?;

        Ok(reservation)
    }

    /// Reservations that still need a recorder: scheduled or recording, not yet ended
    pub fn get_pending_reservations(&self, now: i64) -> Result<Vec<Reservation>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT * FROM reservations
             WHERE status IN ('scheduled', 'recording')
             AND end_at > ?1
             ORDER BY start_at ASC",
        )?;

        let reservations = stmt
            .query_map(params![now], reservation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(reservations)
    }

    /// Insert or refresh a program in the local schedule cache
    pub fn upsert_program(&self, program: &Program) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT INTO programs (id, channel_id, name, start_at, end_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                channel_id = excluded.channel_id,
                name = excluded.name,
                start_at = excluded.start_at,
                end_at = excluded.end_at",
            params![
                program.id,
                program.channel_id,
                program.name,
                program.start_at,
                program.end_at
            ],
        )?;

        Ok(())
    }

    /// Get recorded item by ID
    pub fn get_recorded(&self, id: RecordedId) -> Result<Option<Recorded>> {
        let conn = self.get_conn()?;

        let recorded = conn
            .query_row(
                "SELECT * FROM recorded WHERE id = ?1",
                params![id],
                recorded_from_row,
            )
            .optional()?;

        Ok(recorded)
    }

    pub fn get_video_files(&self, recorded_id: RecordedId) -> Result<Vec<VideoFile>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, recorded_id, file_path, size_bytes FROM video_files WHERE recorded_id = ?1",
        )?;
        let files = stmt
            .query_map(params![recorded_id], |row| {
                Ok(VideoFile {
                    id: row.get("id")?,
                    recorded_id: row.get("recorded_id")?,
                    file_path: row.get("file_path")?,
                    size_bytes: row.get("size_bytes")?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(files)
    }

    /// Finished recordings, oldest first, for cleanup
    pub fn get_finished_recorded(&self) -> Result<Vec<Recorded>> {
        self.query_recorded(false)
    }

    /// Recordings still being written, oldest first
    pub fn get_recording_recorded(&self) -> Result<Vec<Recorded>> {
        self.query_recorded(true)
    }

    fn query_recorded(&self, is_recording: bool) -> Result<Vec<Recorded>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT * FROM recorded
             WHERE is_recording = ?1
             ORDER BY end_at ASC, id ASC",
        )?;

        let recorded = stmt
            .query_map(params![is_recording], recorded_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(recorded)
    }

    /// Total stored size of a recorded item's video files
    pub fn recorded_size(&self, recorded_id: RecordedId) -> Result<i64> {
        let conn = self.get_conn()?;
        let size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM video_files WHERE recorded_id = ?1",
            params![recorded_id],
            |row| row.get(0),
        )?;
        Ok(size)
    }

    /// Delete a recorded item with its video file rows; returns file paths for deletion
    pub fn delete_recorded(&self, id: RecordedId) -> Result<Vec<String>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let paths = {
            let mut stmt = tx.prepare("SELECT file_path FROM video_files WHERE recorded_id = ?1")?;
            let paths = stmt
                .query_map(params![id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            paths
        };

        tx.execute("DELETE FROM video_files WHERE recorded_id = ?1", params![id])?;
        tx.execute("DELETE FROM drop_logs WHERE recorded_id = ?1", params![id])?;
        tx.execute("DELETE FROM recorded WHERE id = ?1", params![id])?;
        tx.commit()?;

        info!("Deleted recorded {} from database", id);
        Ok(paths)
    }

    /// Written by the drop-analysis collaborator
    pub fn save_drop_log(&self, recorded_id: RecordedId, summary: &DropLogSummary) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT INTO drop_logs (recorded_id, error_cnt, drop_cnt, scrambling_cnt)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(recorded_id) DO UPDATE SET
                error_cnt = excluded.error_cnt,
                drop_cnt = excluded.drop_cnt,
                scrambling_cnt = excluded.scrambling_cnt",
            params![
                recorded_id,
                summary.error_cnt,
                summary.drop_cnt,
                summary.scrambling_cnt
            ],
        )?;

        Ok(())
    }

    pub fn get_history(&self, rule_id: i64) -> Result<Vec<HistoryEntry>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT rule_id, program_id, name, channel_id, end_at
             FROM recorded_history WHERE rule_id = ?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![rule_id], |row| {
                Ok(HistoryEntry {
                    rule_id: row.get(0)?,
                    program_id: row.get(1)?,
                    name: row.get(2)?,
                    channel_id: row.get(3)?,
                    end_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Get DVR settings
    pub fn get_settings(&self) -> Result<DvrSettings> {
        let conn = self.get_conn()?;

        let mut settings = DvrSettings::default();

        let mut stmt = conn.prepare("SELECT key, value FROM dvr_settings")?;
        let rows = stmt.query_map([], |row| {
            let key: String = row.get(0)?;
            let value: String = row.get(1)?;
            Ok((key, value))
        })?;

        for row in rows {
            let (key, value) = row?;
            match key.as_str() {
                "storage_path" => settings.storage_path = value,
                "max_disk_usage_percent" => {
                    if let Ok(v) = value.parse() {
                        settings.max_disk_usage_percent = v;
                    }
                }
                "auto_cleanup_enabled" => {
                    settings.auto_cleanup_enabled = value == "true" || value == "1";
                }
                "keep_recordings_days" => {
                    settings.keep_recordings_days = value.parse().ok();
                }
                _ => {}
            }
        }

        Ok(settings)
    }

    /// Save DVR setting
    pub fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT INTO dvr_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;

        Ok(())
    }
}

fn reservation_from_row(row: &Row) -> rusqlite::Result<Reservation> {
    let channel_type: String = row.get("channel_type")?;
    let status: String = row.get("status")?;
    Ok(Reservation {
        id: row.get("id")?,
        channel_id: row.get("channel_id")?,
        channel_type: channel_type.parse().unwrap_or(ChannelType::Terrestrial),
        channel: row.get("channel")?,
        program_id: row.get("program_id")?,
        rule_id: row.get("rule_id")?,
        name: row.get("name")?,
        start_at: row.get("start_at")?,
        end_at: row.get("end_at")?,
        allow_end_lack: row.get("allow_end_lack")?,
        is_conflict: row.get("is_conflict")?,
        is_skip: row.get("is_skip")?,
        is_overlap: row.get("is_overlap")?,
        status: status.parse().unwrap_or(ReservationStatus::Scheduled),
    })
}

fn recorded_from_row(row: &Row) -> rusqlite::Result<Recorded> {
    Ok(Recorded {
        id: row.get("id")?,
        reservation_id: row.get("reservation_id")?,
        rule_id: row.get("rule_id")?,
        program_id: row.get("program_id")?,
        channel_id: row.get("channel_id")?,
        name: row.get("name")?,
        start_at: row.get("start_at")?,
        end_at: row.get("end_at")?,
        is_recording: row.get("is_recording")?,
        error_cnt: row.get("error_cnt")?,
        drop_cnt: row.get("drop_cnt")?,
        scrambling_cnt: row.get("scrambling_cnt")?,
        created_at: row.get("created_at")?,
    })
}

impl RecordingStore for DvrDatabase {
    fn reservation_exists(&self, id: ReservationId) -> Result<bool> {
        let conn = self.get_conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM reservations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn get_program(&self, id: ProgramId) -> Result<Option<Program>> {
        let conn = self.get_conn()?;

        let program = conn
            .query_row(
                "SELECT id, channel_id, name, start_at, end_at FROM programs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Program {
                        id: row.get(0)?,
                        channel_id: row.get(1)?,
                        name: row.get(2)?,
                        start_at: row.get(3)?,
                        end_at: row.get(4)?,
                    })
                },
            )
            .optional()?;

        Ok(program)
    }

    fn add_recorded(&self, recorded: &NewRecorded) -> Result<(RecordedId, VideoFileId)> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO recorded (
                reservation_id, rule_id, program_id, channel_id, name,
                start_at, end_at, is_recording, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                recorded.reservation_id,
                recorded.rule_id,
                recorded.program_id,
                recorded.channel_id,
                recorded.name,
                recorded.start_at,
                recorded.end_at,
                now_ms(),
            ],
        )?;
        let recorded_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO video_files (recorded_id, file_path, size_bytes) VALUES (?1, ?2, 0)",
            params![recorded_id, recorded.file_path],
        )?;
        let video_file_id = tx.last_insert_rowid();

        tx.commit()?;

        info!(
            "Added recorded {} for reservation {}",
            recorded_id, recorded.reservation_id
        );
        Ok((recorded_id, video_file_id))
    }

    fn update_recorded_metadata(&self, id: RecordedId, reservation: &Reservation) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "UPDATE recorded SET rule_id = ?1, name = ?2 WHERE id = ?3",
            params![reservation.rule_id, reservation.name, id],
        )?;

        debug!("Synced recorded {} with reservation {}", id, reservation.id);
        Ok(())
    }

    fn finish_recording(&self, id: RecordedId) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE recorded SET is_recording = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn update_video_file_size(&self, id: VideoFileId, size_bytes: i64) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE video_files SET size_bytes = ?1 WHERE id = ?2",
            params![size_bytes, id],
        )?;
        Ok(())
    }

    fn drop_log(&self, id: RecordedId) -> Result<Option<DropLogSummary>> {
        let conn = self.get_conn()?;

        let summary = conn
            .query_row(
                "SELECT error_cnt, drop_cnt, scrambling_cnt FROM drop_logs WHERE recorded_id = ?1",
                params![id],
                |row| {
                    Ok(DropLogSummary {
                        error_cnt: row.get(0)?,
                        drop_cnt: row.get(1)?,
                        scrambling_cnt: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(summary)
    }

    fn apply_drop_log(&self, id: RecordedId, summary: &DropLogSummary) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE recorded SET error_cnt = ?1, drop_cnt = ?2, scrambling_cnt = ?3 WHERE id = ?4",
            params![summary.error_cnt, summary.drop_cnt, summary.scrambling_cnt, id],
        )?;
        Ok(())
    }

    fn add_history(&self, entry: &HistoryEntry) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO recorded_history (rule_id, program_id, name, channel_id, end_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.rule_id,
                entry.program_id,
                entry.name,
                entry.channel_id,
                entry.end_at
            ],
        )?;
        Ok(())
    }
}
