use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use facewatch_core::settings::validate_setting;
use facewatch_core::{
    DetectionEvent, EventKind, EventPayload, EventSink, ProviderError, SettingsProvider, SinkError,
};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Result, StoreError};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_embeddings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    embedding   TEXT NOT NULL,
    dimension   INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_face_embeddings_identity
    ON face_embeddings(identity_id);

CREATE TABLE IF NOT EXISTS system_settings (
    name        TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS detection_log (
    id          TEXT PRIMARY KEY,
    source      TEXT NOT NULL,
    kind        TEXT NOT NULL,
    subject     TEXT,
    confidence  REAL,
    payload     TEXT NOT NULL,
    notes       TEXT NOT NULL,
    detected_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_detection_log_time
    ON detection_log(detected_at);
";

/// SQLite-backed identity store, settings provider and event sink.
///
/// One connection behind a mutex: sessions read identities rarely and
/// events arrive at alert rate, so contention is negligible.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "store opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Persist a setting after the same validation applied on read.
    pub fn set_setting(&self, name: &str, value: &str) -> Result<()> {
        validate_setting(name, value)?;
        self.conn()?.execute(
            "INSERT INTO system_settings (name, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![name, value.trim(), Utc::now().to_rfc3339()],
        )?;
        tracing::info!(setting = name, value, "setting updated");
        Ok(())
    }

    /// Every stored setting as `(name, value)`, sorted by name.
    pub fn stored_settings(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name, value FROM system_settings ORDER BY name")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn log_event(&self, event: &DetectionEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        // Retried deliveries carry the same id.
        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO detection_log
                (id, source, kind, subject, confidence, payload, notes, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id.to_string(),
                event.source,
                event.kind.as_str(),
                event.subject,
                event.confidence.map(f64::from),
                payload,
                event.notes,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            tracing::debug!(id = %event.id, "event already logged");
        }
        Ok(())
    }

    /// Most recent events first, optionally filtered by kind.
    pub fn recent_events(&self, limit: usize, kind: Option<EventKind>) -> Result<Vec<DetectionEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source, kind, subject, confidence, payload, notes, detected_at
             FROM detection_log
             WHERE ?1 IS NULL OR kind = ?1
             ORDER BY detected_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![kind.map(|k| k.as_str()), limit as i64],
            |row| {
                Ok(RawEvent {
                    id: row.get(0)?,
                    source: row.get(1)?,
                    kind: row.get(2)?,
                    subject: row.get(3)?,
                    confidence: row.get(4)?,
                    payload: row.get(5)?,
                    notes: row.get(6)?,
                    detected_at: row.get(7)?,
                })
            },
        )?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }
        Ok(events)
    }

    pub fn event_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM detection_log", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

struct RawEvent {
    id: String,
    source: String,
    kind: String,
    subject: Option<String>,
    confidence: Option<f64>,
    payload: String,
    notes: String,
    detected_at: String,
}

impl RawEvent {
    fn into_event(self) -> Result<DetectionEvent> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::InvalidDbValue(format!("event id {}: {e}", self.id)))?;
        let kind = EventKind::parse(&self.kind)
            .ok_or_else(|| StoreError::InvalidDbValue(format!("event kind {}", self.kind)))?;
        let payload: EventPayload = serde_json::from_str(&self.payload)?;
        Ok(DetectionEvent {
            id,
            source: self.source,
            kind,
            subject: self.subject,
            confidence: self.confidence.map(|c| c as f32),
            payload,
            notes: self.notes,
            timestamp: parse_time(&self.detected_at)?,
        })
    }
}

pub(crate) fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidDbValue(format!("timestamp {value}: {e}")))
}

impl SettingsProvider for SqliteStore {
    fn get(&self, name: &str, default: &str) -> std::result::Result<String, ProviderError> {
        let value: Option<String> = self
            .conn()?
            .query_row(
                "SELECT value FROM system_settings WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;
        Ok(value.unwrap_or_else(|| default.to_string()))
    }
}

impl EventSink for SqliteStore {
    fn emit(&self, event: &DetectionEvent) -> std::result::Result<(), SinkError> {
        self.log_event(event).map_err(SinkError::from)
    }
}

/// `$XDG_DATA_HOME/facewatch/facewatch.db`, falling back to `~/.local/share`.
pub fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch")
        .join("facewatch.db")
}
