use crate::recognition::{Arrival, LoopError, LoopHandle};
use asisto_core::{EnrolledIdentity, Snapshot};
use asisto_store::{Store, StoreError};
use chrono::{NaiveDate, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.asisto.Attendance1";
pub const OBJECT_PATH: &str = "/org/asisto/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.asisto.Attendance1
/// Object path: /org/asisto/Attendance1
pub struct AttendanceService {
    handle: LoopHandle,
    store: Arc<Store>,
}

impl AttendanceService {
    pub fn new(handle: LoopHandle, store: Arc<Store>) -> Self {
        Self { handle, store }
    }

    async fn refresh(&self) {
        if let Err(e) = self.handle.refresh_gallery().await {
            tracing::warn!(error = %e, "enrolled set not refreshed");
        }
    }
}

#[interface(name = "org.asisto.Attendance1")]
impl AttendanceService {
    /// Begin scanning; loads the face models first if needed.
    async fn start(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start requested");
        let state = self.handle.start().await.map_err(loop_error)?;
        Ok(state.to_string())
    }

    async fn stop(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop requested");
        let state = self.handle.stop().await.map_err(loop_error)?;
        Ok(state.to_string())
    }

    /// Retry a failed model load.
    async fn reload(&self) -> zbus::fdo::Result<String> {
        tracing::info!("reload requested");
        let state = self.handle.reload().await.map_err(loop_error)?;
        Ok(state.to_string())
    }

    /// Loop snapshot plus store counts, as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.handle.snapshot();
        let identities = self.store.count_identities().await.map_err(store_error)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": identities,
            "loop": snapshot,
        })
        .to_string())
    }

    /// Enrolled identities without their descriptors, as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.store.list_identities().await.map_err(store_error)?;
        let summaries: Vec<_> = identities.iter().map(identity_summary).collect();
        Ok(serde_json::Value::Array(summaries).to_string())
    }

    /// Remove an identity. Attendance history is kept.
    async fn remove_identity(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove_identity requested");
        let removed = self.store.delete_identity(id).await.map_err(store_error)?;
        if removed {
            self.refresh().await;
        }
        Ok(removed)
    }

    /// Pause scanning and hold an unknown face for enrollment.
    async fn select_unknown(&self, candidate: u64) -> zbus::fdo::Result<String> {
        let face = self.handle.select_unknown(candidate).await.map_err(loop_error)?;
        serde_json::to_string(&face).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Enroll the held face and resume scanning.
    async fn enroll_selected(&self, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "enroll_selected requested");
        let identity = self.handle.enroll_selected(name).await.map_err(loop_error)?;
        Ok(identity_summary(&identity).to_string())
    }

    async fn cancel_selection(&self) -> zbus::fdo::Result<String> {
        let state = self.handle.cancel_selection().await.map_err(loop_error)?;
        Ok(state.to_string())
    }

    /// Enroll the most confident face of an image file readable by the daemon.
    async fn enroll_from_image(&self, name: &str, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, path, "enroll_from_image requested");
        let identity = self
            .handle
            .enroll_from_image(name, PathBuf::from(path))
            .await
            .map_err(loop_error)?;
        Ok(identity_summary(&identity).to_string())
    }

    /// Rebroadcast everyone currently recognized. Returns how many.
    async fn announce(&self) -> zbus::fdo::Result<u32> {
        let batch = self.handle.announce().await.map_err(loop_error)?;
        Ok(batch.len() as u32)
    }

    /// Attendance records of one day (`YYYY-MM-DD`, or empty for today), as JSON.
    async fn attendance_on(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        let records = self.store.attendance_by_date(date).await.map_err(store_error)?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Full store contents as JSON.
    async fn export(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.store.export_all().await.map_err(store_error)?;
        serde_json::to_string(&snapshot).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Replace the full store contents. Returns the number of identities imported.
    async fn import(&self, json: &str) -> zbus::fdo::Result<u32> {
        let snapshot: Snapshot = serde_json::from_str(json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid snapshot: {e}")))?;
        let count = snapshot.identities.len() as u32;
        tracing::warn!(identities = count, records = snapshot.attendance.len(), "import requested");
        self.store.import_all(snapshot).await.map_err(store_error)?;
        self.refresh().await;
        Ok(count)
    }

    /// Batch of newly recorded arrivals, as a JSON array.
    #[zbus(signal)]
    async fn attendance_recorded(emitter: &SignalEmitter<'_>, batch: &str) -> zbus::Result<()>;
}

/// Re-emit loop arrival batches as `AttendanceRecorded` signals.
pub async fn forward_arrivals(
    conn: zbus::Connection,
    mut arrivals: broadcast::Receiver<Vec<Arrival>>,
) -> zbus::Result<()> {
    let iface = conn
        .object_server()
        .interface::<_, AttendanceService>(OBJECT_PATH)
        .await?;

    loop {
        match arrivals.recv().await {
            Ok(batch) => {
                let json = match serde_json::to_string(&batch) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "could not encode arrival batch");
                        continue;
                    }
                };
                AttendanceService::attendance_recorded(iface.signal_emitter(), &json).await?;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "arrival notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

fn identity_summary(identity: &EnrolledIdentity) -> serde_json::Value {
    serde_json::json!({
        "id": identity.id,
        "displayName": identity.display_name,
        "shortCode": identity.short_code,
        "createdAt": identity.created_at,
        "lastSeenAt": identity.last_seen_at,
    })
}

fn parse_date(raw: &str) -> zbus::fdo::Result<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Utc::now().date_naive());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid date {raw:?}: {e}")))
}

fn loop_error(e: LoopError) -> zbus::fdo::Error {
    if e.is_validation() {
        zbus::fdo::Error::InvalidArgs(e.to_string())
    } else {
        zbus::fdo::Error::Failed(e.to_string())
    }
}

fn store_error(e: StoreError) -> zbus::fdo::Error {
    loop_error(LoopError::Store(e))
}
