//! asisto-store — Durable storage of enrolled identities and attendance.
//!
//! Backed by SQLite through `tokio-rusqlite`: every operation runs as one
//! closure on the connection's own thread, so a check-then-insert inside a
//! single closure can never interleave with another write.

mod schema;

use asisto_core::shortcode::short_code;
use asisto_core::{AttendanceRecord, Embedding, EnrolledIdentity, Snapshot};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use schema::{
    encode_date, encode_embedding, encode_time, AttendanceRow, IdentityRow, ATTENDANCE_COLUMNS,
    IDENTITY_COLUMNS, SCHEMA, SCHEMA_VERSION,
};
use std::path::Path;
use thiserror::Error;

/// Method recorded for attendance marked by the recognition loop.
pub const FACIAL_RECOGNITION: &str = "facial_recognition";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("display name must not be empty")]
    EmptyName,
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding contains non-finite values")]
    NonFiniteEmbedding,
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection closed")]
    Closed,
    #[error("store connection: {0}")]
    Connection(String),
}

impl StoreError {
    /// Caller-input problems: reject and let the caller re-prompt.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StoreError::EmptyName
                | StoreError::DimensionMismatch { .. }
                | StoreError::NonFiniteEmbedding
                | StoreError::UnknownIdentity(_)
        )
    }

    /// Storage-layer failures: stop writing until the store is reopened.
    pub fn is_storage(&self) -> bool {
        !self.is_validation()
    }
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        match e {
            tokio_rusqlite::Error::ConnectionClosed => StoreError::Closed,
            tokio_rusqlite::Error::Rusqlite(e) => StoreError::Sqlite(e),
            other => StoreError::Connection(other.to_string()),
        }
    }
}

/// Identity and attendance store.
pub struct Store {
    conn: tokio_rusqlite::Connection,
    descriptor_dim: usize,
}

impl Store {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>, descriptor_dim: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Connection(format!("{}: {e}", dir.display())))?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        tracing::info!(path = %path.display(), descriptor_dim, "opened attendance store");
        Self::init(conn, descriptor_dim).await
    }

    pub async fn open_in_memory(descriptor_dim: usize) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn, descriptor_dim).await
    }

    async fn init(conn: tokio_rusqlite::Connection, descriptor_dim: usize) -> Result<Self, StoreError> {
        let store = Self { conn, descriptor_dim };
        store
            .with_conn(|c| {
                c.execute_batch(SCHEMA)?;
                let version: i64 = c.query_row("PRAGMA user_version", [], |r| r.get(0))?;
                if version == 0 {
                    c.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
                } else if version != SCHEMA_VERSION {
                    tracing::warn!(found = version, expected = SCHEMA_VERSION, "unexpected store schema version");
                }
                Ok(())
            })
            .await?;
        Ok(store)
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await.map_err(StoreError::from)
    }

    pub fn descriptor_dim(&self) -> usize {
        self.descriptor_dim
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.conn.call(move |c| Ok(f(c))).await?
    }

    fn validate_embedding(&self, embedding: &Embedding) -> Result<(), StoreError> {
        if embedding.len() != self.descriptor_dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.descriptor_dim,
                actual: embedding.len(),
            });
        }
        if embedding.values.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::NonFiniteEmbedding);
        }
        Ok(())
    }

    /// Register a new identity. The name is trimmed and must not be empty.
    pub async fn enroll(&self, display_name: &str, embedding: Embedding) -> Result<EnrolledIdentity, StoreError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        self.validate_embedding(&embedding)?;

        let created_at = Utc::now();
        let identity = EnrolledIdentity {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            short_code: short_code(display_name, created_at.year()),
            embedding,
            created_at,
            last_seen_at: None,
        };

        let row = identity.clone();
        self.with_conn(move |c| {
            insert_identity(c, &row)?;
            Ok(())
        })
        .await?;

        tracing::info!(id = %identity.id, name = %identity.display_name, code = %identity.short_code, "identity enrolled");
        Ok(identity)
    }

    /// All identities in enrollment order.
    pub async fn list_identities(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let dim = self.descriptor_dim;
        self.with_conn(move |c| {
            let mut stmt = c.prepare(&format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY rowid"))?;
            let rows = stmt.query_map([], IdentityRow::from_row)?;
            rows.map(|r| r?.decode(dim)).collect()
        })
        .await
    }

    pub async fn get_identity(&self, id: &str) -> Result<Option<EnrolledIdentity>, StoreError> {
        let dim = self.descriptor_dim;
        let id = id.to_string();
        self.with_conn(move |c| {
            c.query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
                [&id],
                IdentityRow::from_row,
            )
            .optional()?
            .map(|row| row.decode(dim))
            .transpose()
        })
        .await
    }

    /// Exact-name lookup. Names are not unique.
    pub async fn find_by_name(&self, display_name: &str) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let dim = self.descriptor_dim;
        let name = display_name.trim().to_string();
        self.with_conn(move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {IDENTITY_COLUMNS} FROM identities WHERE display_name = ?1 ORDER BY rowid"
            ))?;
            let rows = stmt.query_map([&name], IdentityRow::from_row)?;
            rows.map(|r| r?.decode(dim)).collect()
        })
        .await
    }

    /// Case-insensitive substring search over display names.
    pub async fn search_identities(&self, query: &str) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let needle = query.to_lowercase();
        Ok(self
            .list_identities()
            .await?
            .into_iter()
            .filter(|i| i.display_name.to_lowercase().contains(&needle))
            .collect())
    }

    pub async fn count_identities(&self) -> Result<usize, StoreError> {
        self.with_conn(|c| {
            let n: i64 = c.query_row("SELECT COUNT(*) FROM identities", [], |r| r.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    /// Remove an identity. Unknown ids succeed with `false`.
    /// Attendance history referencing the identity is kept.
    pub async fn delete_identity(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        let removed = self
            .with_conn(move |c| Ok(c.execute("DELETE FROM identities WHERE id = ?1", [&id])? > 0))
            .await?;
        if removed {
            tracing::info!("identity removed");
        }
        Ok(removed)
    }

    /// Update `last_seen_at` only. Returns whether the identity exists.
    pub async fn touch_last_seen(&self, identity_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let id = identity_id.to_string();
        self.with_conn(move |c| {
            Ok(c.execute(
                "UPDATE identities SET last_seen_at = ?1 WHERE id = ?2",
                params![encode_time(&at), id],
            )? > 0)
        })
        .await
    }

    /// Mark attendance for today. See [`Store::record_attendance_at`].
    pub async fn record_attendance(
        &self,
        identity_id: &str,
        confidence: f32,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        self.record_attendance_at(identity_id, confidence, Utc::now()).await
    }

    /// Insert an attendance record for the calendar day of `at` unless one
    /// already exists, and update the identity's `last_seen_at` either way.
    /// Returns the new record, or `None` when the day was already recorded.
    pub async fn record_attendance_at(
        &self,
        identity_id: &str,
        confidence: f32,
        at: DateTime<Utc>,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let identity_id = identity_id.to_string();
        let date = at.date_naive();

        let inserted = self
            .with_conn(move |c| {
                let tx = c.transaction()?;

                let seen = tx.execute(
                    "UPDATE identities SET last_seen_at = ?1 WHERE id = ?2",
                    params![encode_time(&at), identity_id],
                )?;
                if seen == 0 {
                    return Err(StoreError::UnknownIdentity(identity_id));
                }

                let already: bool = tx
                    .query_row(
                        "SELECT 1 FROM attendance WHERE identity_id = ?1 AND date = ?2",
                        params![identity_id, encode_date(&date)],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);

                let record = if already {
                    None
                } else {
                    tx.execute(
                        "INSERT INTO attendance (identity_id, timestamp, date, confidence, method)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            identity_id,
                            encode_time(&at),
                            encode_date(&date),
                            confidence as f64,
                            FACIAL_RECOGNITION
                        ],
                    )?;
                    Some(AttendanceRecord {
                        id: tx.last_insert_rowid(),
                        identity_id,
                        timestamp: at,
                        date,
                        confidence,
                        method: FACIAL_RECOGNITION.to_string(),
                    })
                };

                tx.commit()?;
                Ok(record)
            })
            .await?;

        if let Some(record) = &inserted {
            tracing::info!(identity = %record.identity_id, date = %record.date, confidence, "attendance recorded");
        }
        Ok(inserted)
    }

    pub async fn has_attendance_today(&self, identity_id: &str) -> Result<bool, StoreError> {
        self.has_attendance_on(identity_id, Utc::now().date_naive()).await
    }

    pub async fn has_attendance_on(&self, identity_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let id = identity_id.to_string();
        self.with_conn(move |c| {
            Ok(c.query_row(
                "SELECT 1 FROM attendance WHERE identity_id = ?1 AND date = ?2",
                params![id, encode_date(&date)],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
        })
        .await
    }

    pub async fn attendance_by_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_attendance("date = ?1", encode_date(&date)).await
    }

    pub async fn attendance_by_identity(&self, identity_id: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_attendance("identity_id = ?1", identity_id.to_string()).await
    }

    async fn query_attendance(
        &self,
        filter: &'static str,
        value: String,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.with_conn(move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {ATTENDANCE_COLUMNS} FROM attendance WHERE {filter} ORDER BY id"
            ))?;
            let rows = stmt.query_map([&value], AttendanceRow::from_row)?;
            rows.map(|r| r?.decode()).collect()
        })
        .await
    }

    /// Dump both collections.
    pub async fn export_all(&self) -> Result<Snapshot, StoreError> {
        let dim = self.descriptor_dim;
        self.with_conn(move |c| {
            let mut stmt = c.prepare(&format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY rowid"))?;
            let identities = stmt
                .query_map([], IdentityRow::from_row)?
                .map(|r| r?.decode(dim))
                .collect::<Result<Vec<_>, StoreError>>()?;

            let mut stmt = c.prepare(&format!("SELECT {ATTENDANCE_COLUMNS} FROM attendance ORDER BY id"))?;
            let attendance = stmt
                .query_map([], AttendanceRow::from_row)?
                .map(|r| r?.decode())
                .collect::<Result<Vec<_>, StoreError>>()?;

            Ok(Snapshot { identities, attendance })
        })
        .await
    }

    /// Replace the entire contents of the store with `snapshot`.
    ///
    /// Destructive. Everything is validated up front and written in one
    /// transaction, so a rejected snapshot leaves the store untouched.
    pub async fn import_all(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        for identity in &snapshot.identities {
            if identity.display_name.trim().is_empty() {
                return Err(StoreError::EmptyName);
            }
            self.validate_embedding(&identity.embedding)?;
        }

        let (identities, records) = (snapshot.identities.len(), snapshot.attendance.len());
        self.with_conn(move |c| {
            let tx = c.transaction()?;
            tx.execute("DELETE FROM attendance", [])?;
            tx.execute("DELETE FROM identities", [])?;
            for identity in &snapshot.identities {
                insert_identity(&tx, identity)?;
            }
            for record in &snapshot.attendance {
                tx.execute(
                    &format!("INSERT INTO attendance ({ATTENDANCE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                    params![
                        record.id,
                        record.identity_id,
                        encode_time(&record.timestamp),
                        encode_date(&record.date),
                        record.confidence as f64,
                        record.method
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::warn!(identities, records, "store contents replaced by import");
        Ok(())
    }
}

fn insert_identity(c: &rusqlite::Connection, identity: &EnrolledIdentity) -> Result<(), StoreError> {
    c.execute(
        &format!("INSERT INTO identities ({IDENTITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
        params![
            identity.id,
            identity.display_name,
            identity.short_code,
            encode_embedding(&identity.embedding),
            encode_time(&identity.created_at),
            identity.last_seen_at.as_ref().map(encode_time),
        ],
    )?;
    Ok(())
}
