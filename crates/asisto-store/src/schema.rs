//! Table layout and row codecs.

use crate::StoreError;
use asisto_core::{AttendanceRecord, Embedding, EnrolledIdentity};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::Row;

pub(crate) const SCHEMA_VERSION: i64 = 1;

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id            TEXT PRIMARY KEY,
    display_name  TEXT NOT NULL,
    short_code    TEXT NOT NULL,
    embedding     BLOB NOT NULL,
    created_at    TEXT NOT NULL,
    last_seen_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_identities_name ON identities(display_name);

CREATE TABLE IF NOT EXISTS attendance (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id  TEXT NOT NULL,
    timestamp    TEXT NOT NULL,
    date         TEXT NOT NULL,
    confidence   REAL NOT NULL,
    method       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_identity ON attendance(identity_id);
CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_once_per_day ON attendance(identity_id, date);
";

pub(crate) const IDENTITY_COLUMNS: &str =
    "id, display_name, short_code, embedding, created_at, last_seen_at";
pub(crate) const ATTENDANCE_COLUMNS: &str = "id, identity_id, timestamp, date, confidence, method";

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

pub(crate) fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn encode_date(d: &NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

fn decode_time(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt { id: id.to_string(), reason: format!("timestamp {raw:?}: {e}") })
}

/// Little-endian f32 sequence.
pub(crate) fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding.values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_embedding(id: &str, blob: &[u8], dim: usize) -> Result<Embedding, StoreError> {
    if blob.len() != dim * 4 {
        return Err(StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("embedding blob is {} bytes, expected {}", blob.len(), dim * 4),
        });
    }
    let values: Vec<f32> = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
        return Err(StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("embedding value {pos} is {}", values[pos]),
        });
    }
    Ok(Embedding::new(values))
}

/// Raw identity row, decoded and validated by [`IdentityRow::decode`].
pub(crate) struct IdentityRow {
    id: String,
    display_name: String,
    short_code: String,
    embedding: Vec<u8>,
    created_at: String,
    last_seen_at: Option<String>,
}

impl IdentityRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            display_name: row.get(1)?,
            short_code: row.get(2)?,
            embedding: row.get(3)?,
            created_at: row.get(4)?,
            last_seen_at: row.get(5)?,
        })
    }

    pub(crate) fn decode(self, dim: usize) -> Result<EnrolledIdentity, StoreError> {
        let embedding = decode_embedding(&self.id, &self.embedding, dim)?;
        let created_at = decode_time(&self.id, &self.created_at)?;
        let last_seen_at = self
            .last_seen_at
            .as_deref()
            .map(|raw| decode_time(&self.id, raw))
            .transpose()?;
        Ok(EnrolledIdentity {
            id: self.id,
            display_name: self.display_name,
            short_code: self.short_code,
            embedding,
            created_at,
            last_seen_at,
        })
    }
}

pub(crate) struct AttendanceRow {
    id: i64,
    identity_id: String,
    timestamp: String,
    date: String,
    confidence: f64,
    method: String,
}

impl AttendanceRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identity_id: row.get(1)?,
            timestamp: row.get(2)?,
            date: row.get(3)?,
            confidence: row.get(4)?,
            method: row.get(5)?,
        })
    }

    pub(crate) fn decode(self) -> Result<AttendanceRecord, StoreError> {
        let key = format!("attendance#{}", self.id);
        let timestamp = decode_time(&key, &self.timestamp)?;
        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
            .map_err(|e| StoreError::Corrupt { id: key, reason: format!("date {:?}: {e}", self.date) })?;
        Ok(AttendanceRecord {
            id: self.id,
            identity_id: self.identity_id,
            timestamp,
            date,
            confidence: self.confidence as f32,
            method: self.method,
        })
    }
}
