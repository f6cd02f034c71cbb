//! Recognition loop: frames in, attendance out.
//!
//! One task owns all loop state. D-Bus handlers talk to it through a
//! clone-safe [`LoopHandle`]; every command carries a oneshot reply.
//! Commands are always served before the next frame, so `stop` takes effect
//! at the next scheduling point and no frame is processed after it.

use asisto_core::{
    BoundingBox, DetectionError, Embedding, EnrolledIdentity, FaceService, ModelLoadError,
    ModelStatus,
};
use asisto_hw::{CameraError, FrameSource};
use asisto_store::{Store, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("face models unavailable: {0}")]
    Models(#[from] ModelLoadError),
    #[error("face detection failed: {0}")]
    Detection(#[from] DetectionError),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("cannot read image {path}: {reason}")]
    Image { path: String, reason: String },
    #[error("no face found in image")]
    NoFace,
    #[error("no unknown face with id {0}")]
    UnknownCandidate(u64),
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: LoopState,
    },
    #[error("writes disabled after storage failure: {0}")]
    StorageDisabled(String),
    #[error("recognition loop exited")]
    ChannelClosed,
}

impl LoopError {
    /// Caller-input problems, as opposed to failures of the daemon itself.
    pub fn is_validation(&self) -> bool {
        match self {
            LoopError::Store(e) => e.is_validation(),
            LoopError::Image { .. }
            | LoopError::NoFace
            | LoopError::UnknownCandidate(_)
            | LoopError::InvalidState { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Loading,
    Ready,
    Active,
    Paused,
    Failed,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Loading => "loading",
            LoopState::Ready => "ready",
            LoopState::Active => "active",
            LoopState::Paused => "paused",
            LoopState::Failed => "failed",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An identity matched in the most recent frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recognized {
    pub identity_id: String,
    pub display_name: String,
    pub short_code: String,
    pub confidence: f32,
    pub distance: f32,
    pub bbox: BoundingBox,
}

/// A face in the most recent frame that matched nobody. Never persisted
/// unless an operator enrolls it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnknownFace {
    pub id: u64,
    pub bbox: BoundingBox,
    #[serde(skip)]
    pub descriptor: Embedding,
}

/// One entry of an attendance notification batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Arrival {
    pub identity_id: String,
    pub display_name: String,
    pub short_code: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
}

/// Observable loop state, republished after every command and frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSnapshot {
    pub state: LoopState,
    pub model_progress: u8,
    pub model_error: Option<String>,
    pub camera_error: Option<String>,
    pub storage_fault: Option<String>,
    pub enrolled: usize,
    pub recognized: Vec<Recognized>,
    pub unknown: Vec<UnknownFace>,
    pub selected: Option<u64>,
    /// Frames processed during the last second.
    pub fps: usize,
}

impl LoopSnapshot {
    fn idle() -> Self {
        Self {
            state: LoopState::Idle,
            model_progress: 0,
            model_error: None,
            camera_error: None,
            storage_fault: None,
            enrolled: 0,
            recognized: Vec::new(),
            unknown: Vec::new(),
            selected: None,
            fps: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    /// Minimum time between the starts of two processed frames.
    pub min_frame_interval: Duration,
    /// Minimum time between two `last_seen_at` refreshes of one identity.
    pub last_seen_interval: Duration,
}

/// Opens the frame source when scanning starts. Called on a blocking thread.
pub type OpenSource = Arc<dyn Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync>;

type Reply<T> = oneshot::Sender<Result<T, LoopError>>;

/// Messages sent from D-Bus handlers to the loop task.
enum LoopCommand {
    Start(Reply<LoopState>),
    Stop(Reply<LoopState>),
    Reload(Reply<LoopState>),
    SelectUnknown {
        candidate: u64,
        reply: Reply<UnknownFace>,
    },
    EnrollSelected {
        name: String,
        reply: Reply<EnrolledIdentity>,
    },
    CancelSelection(Reply<LoopState>),
    EnrollFromImage {
        name: String,
        path: PathBuf,
        reply: Reply<EnrolledIdentity>,
    },
    Announce(Reply<Vec<Arrival>>),
    RefreshGallery(Reply<usize>),
}

/// Clone-safe handle to the loop task.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::Sender<LoopCommand>,
    snapshot: watch::Receiver<LoopSnapshot>,
    arrivals: broadcast::Sender<Vec<Arrival>>,
}

impl LoopHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> LoopCommand,
    ) -> Result<T, LoopError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| LoopError::ChannelClosed)?;
        reply_rx.await.map_err(|_| LoopError::ChannelClosed)?
    }

    /// Begin scanning, loading the models first if needed.
    pub async fn start(&self) -> Result<LoopState, LoopError> {
        self.request(LoopCommand::Start).await
    }

    pub async fn stop(&self) -> Result<LoopState, LoopError> {
        self.request(LoopCommand::Stop).await
    }

    /// Retry a failed model load.
    pub async fn reload(&self) -> Result<LoopState, LoopError> {
        self.request(LoopCommand::Reload).await
    }

    /// Pause scanning and hold an unknown face for enrollment.
    pub async fn select_unknown(&self, candidate: u64) -> Result<UnknownFace, LoopError> {
        self.request(|reply| LoopCommand::SelectUnknown { candidate, reply })
            .await
    }

    /// Enroll the held face under `name` and resume scanning.
    pub async fn enroll_selected(&self, name: &str) -> Result<EnrolledIdentity, LoopError> {
        let name = name.to_string();
        self.request(|reply| LoopCommand::EnrollSelected { name, reply })
            .await
    }

    pub async fn cancel_selection(&self) -> Result<LoopState, LoopError> {
        self.request(LoopCommand::CancelSelection).await
    }

    /// Enroll the most confident face of a still image.
    pub async fn enroll_from_image(
        &self,
        name: &str,
        path: PathBuf,
    ) -> Result<EnrolledIdentity, LoopError> {
        let name = name.to_string();
        self.request(|reply| LoopCommand::EnrollFromImage { name, path, reply })
            .await
    }

    /// Rebroadcast everyone currently recognized.
    pub async fn announce(&self) -> Result<Vec<Arrival>, LoopError> {
        self.request(LoopCommand::Announce).await
    }

    /// Re-read the enrolled set after out-of-band store changes.
    pub async fn refresh_gallery(&self) -> Result<usize, LoopError> {
        self.request(LoopCommand::RefreshGallery).await
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LoopSnapshot> {
        self.snapshot.clone()
    }

    /// Attendance notification batches. Fire-and-forget: slow receivers lag.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Arrival>> {
        self.arrivals.subscribe()
    }
}

/// Spawn the loop task. It starts `Idle`; nothing is loaded until `start`.
pub fn spawn_recognition_loop(
    service: Arc<FaceService>,
    store: Arc<Store>,
    open_source: OpenSource,
    settings: LoopSettings,
) -> LoopHandle {
    let (tx, commands) = mpsc::channel(16);
    let (snapshot_tx, snapshot_rx) = watch::channel(LoopSnapshot::idle());
    let (arrivals, _) = broadcast::channel(64);
    let (load_tx, loads) = mpsc::unbounded_channel();

    let task = RecognitionLoop {
        service,
        store,
        open_source,
        settings,
        state: LoopState::Idle,
        start_requested: false,
        source: None,
        gallery: Vec::new(),
        recognized: Vec::new(),
        unknown: Vec::new(),
        selected: None,
        next_candidate: 0,
        last_frame: None,
        frame_times: VecDeque::new(),
        last_touched: HashMap::new(),
        model_error: None,
        camera_error: None,
        storage_fault: None,
        snapshot_tx,
        arrivals: arrivals.clone(),
        load_tx,
    };
    tokio::spawn(task.run(commands, loads));

    LoopHandle {
        tx,
        snapshot: snapshot_rx,
        arrivals,
    }
}

struct RecognitionLoop {
    service: Arc<FaceService>,
    store: Arc<Store>,
    open_source: OpenSource,
    settings: LoopSettings,

    state: LoopState,
    start_requested: bool,
    source: Option<Box<dyn FrameSource>>,
    /// Enrolled set, fetched at activation and after enrollments.
    gallery: Vec<EnrolledIdentity>,
    recognized: Vec<Recognized>,
    unknown: Vec<UnknownFace>,
    selected: Option<UnknownFace>,
    next_candidate: u64,
    last_frame: Option<Instant>,
    frame_times: VecDeque<Instant>,
    last_touched: HashMap<String, Instant>,

    model_error: Option<String>,
    camera_error: Option<String>,
    storage_fault: Option<String>,

    snapshot_tx: watch::Sender<LoopSnapshot>,
    arrivals: broadcast::Sender<Vec<Arrival>>,
    load_tx: mpsc::UnboundedSender<Result<(), ModelLoadError>>,
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl RecognitionLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<LoopCommand>,
        mut loads: mpsc::UnboundedReceiver<Result<(), ModelLoadError>>,
    ) {
        tracing::info!("recognition loop started");
        loop {
            let due = self.next_frame_due();
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                Some(outcome) = loads.recv() => self.on_models_loaded(outcome).await,
                _ = sleep_until_due(due), if due.is_some() => self.process_frame().await,
            }
            self.publish();
        }
        tracing::info!("recognition loop exiting");
    }

    fn next_frame_due(&self) -> Option<Instant> {
        if self.state != LoopState::Active || self.source.is_none() {
            return None;
        }
        Some(match self.last_frame {
            Some(last) => last + self.settings.min_frame_interval,
            None => Instant::now(),
        })
    }

    async fn handle(&mut self, cmd: LoopCommand) {
        match cmd {
            LoopCommand::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            LoopCommand::Stop(reply) => {
                let _ = reply.send(Ok(self.stop()));
            }
            LoopCommand::Reload(reply) => {
                let _ = reply.send(Ok(self.reload()));
            }
            LoopCommand::SelectUnknown { candidate, reply } => {
                let _ = reply.send(self.select_unknown(candidate));
            }
            LoopCommand::EnrollSelected { name, reply } => {
                let result = self.enroll_selected(&name).await;
                let _ = reply.send(result);
            }
            LoopCommand::CancelSelection(reply) => {
                let _ = reply.send(self.cancel_selection());
            }
            LoopCommand::EnrollFromImage { name, path, reply } => {
                let result = self.enroll_from_image(&name, path).await;
                let _ = reply.send(result);
            }
            LoopCommand::Announce(reply) => {
                let _ = reply.send(Ok(self.announce()));
            }
            LoopCommand::RefreshGallery(reply) => {
                let result = self.refresh_gallery().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn start(&mut self) -> Result<LoopState, LoopError> {
        match self.state {
            LoopState::Active | LoopState::Paused | LoopState::Loading => {
                self.start_requested = true;
                Ok(self.state)
            }
            LoopState::Failed => {
                let error = match self.service.status() {
                    ModelStatus::Failed(e) => e,
                    _ => ModelLoadError::Aborted,
                };
                Err(LoopError::Models(error))
            }
            LoopState::Idle | LoopState::Ready => {
                self.start_requested = true;
                if self.service.is_loaded() {
                    self.activate().await?;
                } else {
                    self.begin_load(false);
                }
                Ok(self.state)
            }
        }
    }

    fn begin_load(&mut self, retry: bool) {
        self.state = LoopState::Loading;
        self.model_error = None;
        let service = self.service.clone();
        let tx = self.load_tx.clone();
        tokio::spawn(async move {
            let outcome = if retry {
                service.reload_models().await
            } else {
                service.load_models().await
            };
            let _ = tx.send(outcome);
        });
    }

    async fn on_models_loaded(&mut self, outcome: Result<(), ModelLoadError>) {
        if self.state != LoopState::Loading {
            return;
        }
        match outcome {
            Ok(()) => {
                self.state = LoopState::Ready;
                if self.start_requested {
                    if let Err(e) = self.activate().await {
                        tracing::warn!(error = %e, "could not start scanning");
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "recognition unavailable until models are reloaded");
                self.model_error = Some(e.to_string());
                self.state = LoopState::Failed;
            }
        }
    }

    /// Ready/Idle → Active: open the frame source and fetch the enrolled set.
    async fn activate(&mut self) -> Result<(), LoopError> {
        let open = self.open_source.clone();
        let opened = tokio::task::spawn_blocking(move || open())
            .await
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
            .and_then(|r| r);

        let source = match opened {
            Ok(source) => source,
            Err(e) => {
                self.camera_error = Some(e.to_string());
                self.state = LoopState::Ready;
                return Err(e.into());
            }
        };
        self.source = Some(source);
        self.camera_error = None;

        if let Err(e) = self.refresh_gallery().await {
            tracing::warn!(error = %e, "scanning with an empty enrolled set");
        }

        self.state = LoopState::Active;
        self.last_frame = None;
        tracing::info!(enrolled = self.gallery.len(), "scanning started");
        Ok(())
    }

    fn stop(&mut self) -> LoopState {
        self.start_requested = false;
        self.source = None;
        self.recognized.clear();
        self.unknown.clear();
        self.selected = None;
        self.frame_times.clear();
        if self.state != LoopState::Failed {
            self.state = LoopState::Idle;
        }
        tracing::info!(state = %self.state, "scanning stopped");
        self.state
    }

    fn reload(&mut self) -> LoopState {
        match self.state {
            LoopState::Failed => {
                tracing::info!("retrying model load");
                self.begin_load(true);
            }
            LoopState::Idle if !self.service.is_loaded() => self.begin_load(false),
            _ => {}
        }
        self.state
    }

    fn select_unknown(&mut self, candidate: u64) -> Result<UnknownFace, LoopError> {
        if self.state != LoopState::Active {
            return Err(LoopError::InvalidState {
                action: "select a face",
                state: self.state,
            });
        }
        let face = self
            .unknown
            .iter()
            .find(|u| u.id == candidate)
            .cloned()
            .ok_or(LoopError::UnknownCandidate(candidate))?;

        warn_quality(&face.bbox);
        self.selected = Some(face.clone());
        self.state = LoopState::Paused;
        tracing::info!(candidate, "scanning paused for enrollment");
        Ok(face)
    }

    async fn enroll_selected(&mut self, name: &str) -> Result<EnrolledIdentity, LoopError> {
        let descriptor = match (&self.state, &self.selected) {
            (LoopState::Paused, Some(face)) => face.descriptor.clone(),
            _ => {
                return Err(LoopError::InvalidState {
                    action: "enroll a selected face",
                    state: self.state,
                })
            }
        };

        // A rejected name keeps the selection so the operator can retry.
        let identity = self.enroll(name, descriptor).await?;
        self.selected = None;
        self.state = LoopState::Active;
        Ok(identity)
    }

    fn cancel_selection(&mut self) -> Result<LoopState, LoopError> {
        if self.state != LoopState::Paused {
            return Err(LoopError::InvalidState {
                action: "cancel a selection",
                state: self.state,
            });
        }
        self.selected = None;
        self.state = LoopState::Active;
        Ok(self.state)
    }

    async fn enroll_from_image(
        &mut self,
        name: &str,
        path: PathBuf,
    ) -> Result<EnrolledIdentity, LoopError> {
        if name.trim().is_empty() {
            return Err(StoreError::EmptyName.into());
        }

        let shown = path.display().to_string();
        let image = tokio::task::spawn_blocking(move || image::open(&path).map(|i| i.to_rgb8()))
            .await
            .map_err(|e| LoopError::Image {
                path: shown.clone(),
                reason: e.to_string(),
            })?
            .map_err(|e| LoopError::Image {
                path: shown.clone(),
                reason: e.to_string(),
            })?;

        let detection = self
            .service
            .extract_descriptor(image)
            .await?
            .ok_or(LoopError::NoFace)?;
        warn_quality(&detection.bbox);

        let descriptor = detection.descriptor.ok_or(LoopError::NoFace)?;
        self.enroll(name, descriptor).await
    }

    async fn enroll(&mut self, name: &str, descriptor: Embedding) -> Result<EnrolledIdentity, LoopError> {
        if let Some(fault) = &self.storage_fault {
            return Err(LoopError::StorageDisabled(fault.clone()));
        }
        let identity = match self.store.enroll(name, descriptor).await {
            Ok(identity) => identity,
            Err(e) => {
                self.note_store_error(&e);
                return Err(e.into());
            }
        };
        if let Err(e) = self.refresh_gallery().await {
            tracing::warn!(error = %e, "enrolled set not refreshed");
        }
        Ok(identity)
    }

    async fn refresh_gallery(&mut self) -> Result<usize, LoopError> {
        match self.store.list_identities().await {
            Ok(gallery) => {
                self.gallery = gallery;
                Ok(self.gallery.len())
            }
            Err(e) => {
                self.note_store_error(&e);
                Err(e.into())
            }
        }
    }

    fn announce(&self) -> Vec<Arrival> {
        let now = Utc::now();
        let batch: Vec<Arrival> = self
            .recognized
            .iter()
            .map(|r| Arrival {
                identity_id: r.identity_id.clone(),
                display_name: r.display_name.clone(),
                short_code: r.short_code.clone(),
                timestamp: now,
                confidence: r.confidence,
            })
            .collect();
        if !batch.is_empty() {
            let _ = self.arrivals.send(batch.clone());
        }
        batch
    }

    async fn process_frame(&mut self) {
        let started = Instant::now();
        self.last_frame = Some(started);

        let Some(mut source) = self.source.take() else {
            return;
        };
        let captured =
            tokio::task::spawn_blocking(move || {
                let frame = source.next_frame();
                (source, frame)
            })
            .await;

        let frame = match captured {
            Ok((source, frame)) => {
                self.source = Some(source);
                frame
            }
            Err(e) => {
                tracing::error!(error = %e, "frame capture task failed, scanning stopped");
                self.camera_error = Some(e.to_string());
                self.state = LoopState::Ready;
                return;
            }
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed, skipping");
                self.camera_error = Some(e.to_string());
                return;
            }
        };
        self.camera_error = None;

        self.frame_times.push_back(started);
        while self
            .frame_times
            .front()
            .is_some_and(|t| started.duration_since(*t) > Duration::from_secs(1))
        {
            self.frame_times.pop_front();
        }

        let detections = if frame.is_dark {
            Vec::new()
        } else {
            match self.service.detect_faces(frame.image).await {
                Ok(detections) => detections,
                Err(e) => {
                    tracing::debug!(error = %e, seq = frame.sequence, "detection failed, skipping frame");
                    return;
                }
            }
        };

        let now = Utc::now();
        let mut recognized = Vec::new();
        let mut unknown = Vec::new();
        let mut arrivals = Vec::new();
        let mut handled = HashSet::new();

        for detection in detections {
            let Some(descriptor) = detection.descriptor else {
                continue;
            };
            let result = self.service.match_descriptor(&descriptor, &self.gallery);
            let Some(identity) = result.identity(&self.gallery) else {
                let id = self.candidate_id(&descriptor, &unknown);
                unknown.push(UnknownFace {
                    id,
                    bbox: detection.bbox,
                    descriptor,
                });
                continue;
            };

            let seen = Recognized {
                identity_id: identity.id.clone(),
                display_name: identity.display_name.clone(),
                short_code: identity.short_code.clone(),
                confidence: result.confidence,
                distance: result.distance,
                bbox: detection.bbox,
            };
            if handled.insert(seen.identity_id.clone()) {
                if let Some(arrival) = self.mark_present(&seen, now).await {
                    arrivals.push(arrival);
                }
            }
            recognized.push(seen);
        }

        self.recognized = recognized;
        self.unknown = unknown;

        if !arrivals.is_empty() {
            tracing::info!(count = arrivals.len(), "attendance batch");
            let _ = self.arrivals.send(arrivals);
        }
    }

    /// Record today's attendance, or refresh `last_seen_at` when already
    /// present. Returns the arrival, stamped like the stored record, when a
    /// new record was written.
    async fn mark_present(&mut self, seen: &Recognized, now: DateTime<Utc>) -> Option<Arrival> {
        if self.storage_fault.is_some() {
            return None;
        }
        let id = seen.identity_id.as_str();

        let written = match self.store.has_attendance_today(id).await {
            Ok(false) => self.store.record_attendance(id, seen.confidence).await,
            Ok(true) if self.last_seen_due(id) => {
                self.store.touch_last_seen(id, now).await.map(|_| None)
            }
            Ok(true) => return None,
            Err(e) => Err(e),
        };

        match written {
            Ok(record) => {
                self.last_touched.insert(id.to_string(), Instant::now());
                record.map(|record| Arrival {
                    identity_id: seen.identity_id.clone(),
                    display_name: seen.display_name.clone(),
                    short_code: seen.short_code.clone(),
                    timestamp: record.timestamp,
                    confidence: record.confidence,
                })
            }
            Err(StoreError::UnknownIdentity(_)) => {
                tracing::warn!(identity = id, "matched identity no longer enrolled");
                self.gallery.retain(|i| i.id != id);
                None
            }
            Err(e) => {
                self.note_store_error(&e);
                None
            }
        }
    }

    /// Keep the id of the closest unknown face of the previous frame when it
    /// is within the match threshold, so an operator can select it.
    fn candidate_id(&mut self, descriptor: &Embedding, taken: &[UnknownFace]) -> u64 {
        let threshold = self.service.threshold();
        let previous = self
            .unknown
            .iter()
            .filter(|u| u.descriptor.len() == descriptor.len())
            .filter(|u| taken.iter().all(|t| t.id != u.id))
            .map(|u| (u.id, u.descriptor.euclidean_distance(descriptor)))
            .filter(|(_, d)| *d < threshold)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match previous {
            Some((id, _)) => id,
            None => {
                self.next_candidate += 1;
                self.next_candidate
            }
        }
    }

    fn last_seen_due(&self, id: &str) -> bool {
        self.last_touched
            .get(id)
            .map_or(true, |t| t.elapsed() >= self.settings.last_seen_interval)
    }

    fn note_store_error(&mut self, e: &StoreError) {
        if e.is_storage() && self.storage_fault.is_none() {
            tracing::error!(error = %e, "store failure, writes disabled until restart");
            self.storage_fault = Some(e.to_string());
        }
    }

    fn publish(&self) {
        let model_progress = match self.service.status() {
            ModelStatus::Ready => 100,
            _ => self.service.load_progress(),
        };
        self.snapshot_tx.send_replace(LoopSnapshot {
            state: self.state,
            model_progress,
            model_error: self.model_error.clone(),
            camera_error: self.camera_error.clone(),
            storage_fault: self.storage_fault.clone(),
            enrolled: self.gallery.len(),
            recognized: self.recognized.clone(),
            unknown: self.unknown.clone(),
            selected: self.selected.as_ref().map(|s| s.id),
            fps: self.frame_times.len(),
        });
    }
}

fn warn_quality(bbox: &BoundingBox) {
    let issues = bbox.quality_issues();
    if !issues.is_empty() {
        tracing::warn!(?issues, "enrolling a low-quality face");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asisto_core::model::LoadFuture;
    use asisto_core::{Detection, FaceAnalyzer, LoadProgress, ModelLoader};
    use asisto_hw::Frame;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Script = Arc<Mutex<Vec<Detection>>>;

    /// Returns the scripted detections, after failing `failures` frames.
    struct ScriptedAnalyzer {
        script: Script,
        failures: Arc<AtomicUsize>,
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn analyze(&mut self, _frame: &RgbImage) -> Result<Vec<Detection>, DetectionError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(DetectionError::Task("inference backend hiccup".into()));
            }
            Ok(self.script.lock().unwrap().clone())
        }
    }

    struct FakeLoader {
        fail: AtomicBool,
        script: Script,
        failures: Arc<AtomicUsize>,
    }

    impl ModelLoader for FakeLoader {
        fn load<'a>(&'a self, progress: &'a LoadProgress) -> LoadFuture<'a> {
            Box::pin(async move {
                progress.set(50);
                if self.fail.load(Ordering::SeqCst) {
                    return Err(ModelLoadError::Unavailable {
                        artifact: "det_10g.onnx".into(),
                        primary: "<none>".into(),
                        fallback: "/nowhere".into(),
                    });
                }
                Ok(Box::new(ScriptedAnalyzer {
                    script: self.script.clone(),
                    failures: self.failures.clone(),
                }) as Box<dyn FaceAnalyzer>)
            })
        }
    }

    struct FakeCamera(Arc<AtomicUsize>);

    impl FrameSource for FakeCamera {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Frame::from_image(RgbImage::from_pixel(4, 4, Rgb([128, 128, 128]))))
        }
    }

    struct Harness {
        handle: LoopHandle,
        store: Arc<Store>,
        script: Script,
        loader: Arc<FakeLoader>,
        frames: Arc<AtomicUsize>,
        failures: Arc<AtomicUsize>,
    }

    async fn harness(fail_load: bool) -> Harness {
        let store = Store::open_in_memory(2).await.unwrap();
        harness_with(fail_load, store, Duration::from_millis(5)).await
    }

    async fn harness_with(fail_load: bool, store: Store, min_frame_interval: Duration) -> Harness {
        let script: Script = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(AtomicUsize::new(0));
        let loader = Arc::new(FakeLoader {
            fail: AtomicBool::new(fail_load),
            script: script.clone(),
            failures: failures.clone(),
        });
        let service = Arc::new(FaceService::new(loader.clone()));
        let store = Arc::new(store);
        let frames = Arc::new(AtomicUsize::new(0));
        let counter = frames.clone();
        let open: OpenSource = Arc::new(move || {
            Ok(Box::new(FakeCamera(counter.clone())) as Box<dyn FrameSource>)
        });
        let handle = spawn_recognition_loop(
            service,
            store.clone(),
            open,
            LoopSettings {
                min_frame_interval,
                last_seen_interval: Duration::from_secs(60),
            },
        );
        Harness {
            handle,
            store,
            script,
            loader,
            frames,
            failures,
        }
    }

    fn face(descriptor: [f32; 2]) -> Detection {
        Detection {
            bbox: BoundingBox {
                x: 10.0,
                y: 10.0,
                width: 120.0,
                height: 120.0,
                confidence: 0.95,
                landmarks: None,
            },
            descriptor: Some(Embedding::new(descriptor.to_vec())),
        }
    }

    async fn wait_until(
        handle: &LoopHandle,
        pred: impl Fn(&LoopSnapshot) -> bool,
    ) -> LoopSnapshot {
        let mut rx = handle.watch();
        tokio::time::timeout(Duration::from_secs(5), async move {
            rx.wait_for(|s| pred(s)).await.map(|s| s.clone())
        })
        .await
        .expect("timed out waiting for loop state")
        .expect("loop exited")
    }

    #[tokio::test]
    async fn test_match_records_attendance_once_and_broadcasts() {
        let h = harness(false).await;
        let ana = h.store.enroll("Ana Pérez", Embedding::new(vec![0.0, 0.0])).await.unwrap();
        *h.script.lock().unwrap() = vec![face([0.1, 0.0])];
        let mut arrivals = h.handle.subscribe();

        h.handle.start().await.unwrap();
        let snap = wait_until(&h.handle, |s| !s.recognized.is_empty()).await;
        assert_eq!(snap.state, LoopState::Active);
        assert_eq!(snap.recognized[0].identity_id, ana.id);
        assert!((snap.recognized[0].confidence - 0.9).abs() < 1e-5);

        let batch = tokio::time::timeout(Duration::from_secs(5), arrivals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].short_code, ana.short_code);

        // Many more frames, still one record.
        let seen = h.frames.load(Ordering::SeqCst);
        wait_until(&h.handle, |_| h.frames.load(Ordering::SeqCst) > seen + 5).await;
        let records = h.store.attendance_by_identity(&ana.id).await.unwrap();
        assert_eq!(records.len(), 1);
        // The notification carries the stored record's time, not the frame's.
        assert_eq!(batch[0].timestamp, records[0].timestamp);
        assert_eq!(batch[0].timestamp.date_naive(), records[0].date);
        assert!(arrivals.try_recv().is_err());

        let stored = h.store.get_identity(&ana.id).await.unwrap().unwrap();
        assert!(stored.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn test_frames_without_faces_write_nothing() {
        let h = harness(false).await;
        let ana = h.store.enroll("Ana", Embedding::new(vec![0.0, 0.0])).await.unwrap();

        h.handle.start().await.unwrap();
        wait_until(&h.handle, |_| h.frames.load(Ordering::SeqCst) > 5).await;

        let snap = h.handle.snapshot();
        assert!(snap.recognized.is_empty() && snap.unknown.is_empty());
        assert!(snap.storage_fault.is_none());
        assert!(h.store.attendance_by_identity(&ana.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_halts_frame_processing() {
        let h = harness(false).await;
        h.handle.start().await.unwrap();
        wait_until(&h.handle, |_| h.frames.load(Ordering::SeqCst) > 2).await;

        assert_eq!(h.handle.stop().await.unwrap(), LoopState::Idle);
        let after_stop = h.frames.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.frames.load(Ordering::SeqCst), after_stop);
        assert_eq!(h.handle.snapshot().state, LoopState::Idle);

        // Models stay loaded; restarting goes straight to scanning.
        assert_eq!(h.handle.start().await.unwrap(), LoopState::Active);
    }

    #[tokio::test]
    async fn test_unknown_face_enrollment_flow() {
        let h = harness(false).await;
        *h.script.lock().unwrap() = vec![face([0.5, 0.5])];

        h.handle.start().await.unwrap();
        let snap = wait_until(&h.handle, |s| !s.unknown.is_empty()).await;
        let candidate = snap.unknown[0].id;

        let selected = h.handle.select_unknown(candidate).await.unwrap();
        assert_eq!(selected.descriptor, Embedding::new(vec![0.5, 0.5]));
        assert_eq!(h.handle.snapshot().state, LoopState::Paused);
        assert_eq!(h.handle.snapshot().selected, Some(candidate));

        // Blank name is rejected and the selection is kept.
        let err = h.handle.enroll_selected("   ").await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(h.handle.snapshot().state, LoopState::Paused);
        assert_eq!(h.store.count_identities().await.unwrap(), 0);

        let luis = h.handle.enroll_selected("Luis Gómez").await.unwrap();
        assert_eq!(luis.display_name, "Luis Gómez");
        assert_eq!(h.handle.snapshot().state, LoopState::Active);

        // The refreshed enrolled set now matches the same face.
        let snap = wait_until(&h.handle, |s| !s.recognized.is_empty()).await;
        assert_eq!(snap.recognized[0].identity_id, luis.id);
        assert!(snap.unknown.is_empty());
    }

    #[tokio::test]
    async fn test_select_requires_known_candidate_and_active_state() {
        let h = harness(false).await;
        let err = h.handle.select_unknown(1).await.unwrap_err();
        assert!(matches!(err, LoopError::InvalidState { state: LoopState::Idle, .. }));

        h.handle.start().await.unwrap();
        wait_until(&h.handle, |s| s.state == LoopState::Active).await;
        assert!(matches!(
            h.handle.select_unknown(999).await,
            Err(LoopError::UnknownCandidate(999))
        ));
        assert!(h.handle.cancel_selection().await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_selection_resumes() {
        let h = harness(false).await;
        *h.script.lock().unwrap() = vec![face([0.5, 0.5])];
        h.handle.start().await.unwrap();
        let snap = wait_until(&h.handle, |s| !s.unknown.is_empty()).await;

        h.handle.select_unknown(snap.unknown[0].id).await.unwrap();
        let paused_frames = h.frames.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.frames.load(Ordering::SeqCst), paused_frames);

        assert_eq!(h.handle.cancel_selection().await.unwrap(), LoopState::Active);
        wait_until(&h.handle, |_| h.frames.load(Ordering::SeqCst) > paused_frames).await;
        assert_eq!(h.store.count_identities().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_load_needs_explicit_reload() {
        let h = harness(true).await;
        h.handle.start().await.unwrap();
        let snap = wait_until(&h.handle, |s| s.state == LoopState::Failed).await;
        assert!(snap.model_error.unwrap().contains("det_10g.onnx"));

        assert!(matches!(h.handle.start().await, Err(LoopError::Models(_))));
        assert_eq!(h.frames.load(Ordering::SeqCst), 0);

        h.loader.fail.store(false, Ordering::SeqCst);
        h.handle.reload().await.unwrap();
        let snap = wait_until(&h.handle, |s| s.state == LoopState::Active).await;
        assert!(snap.model_error.is_none());
        assert_eq!(snap.model_progress, 100);
    }

    #[tokio::test]
    async fn test_announce_rebroadcasts_recognized() {
        let h = harness(false).await;
        h.store.enroll("Ana", Embedding::new(vec![0.0, 0.0])).await.unwrap();
        *h.script.lock().unwrap() = vec![face([0.0, 0.0])];
        let mut arrivals = h.handle.subscribe();

        assert!(h.handle.announce().await.unwrap().is_empty());

        h.handle.start().await.unwrap();
        wait_until(&h.handle, |s| !s.recognized.is_empty()).await;
        let first = arrivals.recv().await.unwrap();

        let announced = h.handle.announce().await.unwrap();
        assert_eq!(announced.len(), 1);
        let again = arrivals.recv().await.unwrap();
        assert_eq!(again[0].identity_id, first[0].identity_id);
        assert_eq!(again[0].confidence, 1.0);
    }

    #[tokio::test]
    async fn test_enroll_from_image() {
        let h = harness(false).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ana.png");
        RgbImage::from_pixel(8, 8, Rgb([90, 90, 90])).save(&path).unwrap();

        // No face in the image.
        let err = h.handle.enroll_from_image("Ana", path.clone()).await.unwrap_err();
        assert!(matches!(err, LoopError::NoFace));

        *h.script.lock().unwrap() = vec![face([0.25, 0.75])];
        let ana = h.handle.enroll_from_image("Ana", path.clone()).await.unwrap();
        assert_eq!(ana.embedding, Embedding::new(vec![0.25, 0.75]));

        let missing = h
            .handle
            .enroll_from_image("Ana", dir.path().join("missing.png"))
            .await
            .unwrap_err();
        assert!(matches!(missing, LoopError::Image { .. }));

        let blank = h.handle.enroll_from_image(" ", path).await.unwrap_err();
        assert!(matches!(blank, LoopError::Store(StoreError::EmptyName)));
        assert_eq!(h.store.count_identities().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_removed_identity_is_dropped_from_gallery() {
        let h = harness(false).await;
        let ana = h.store.enroll("Ana", Embedding::new(vec![0.0, 0.0])).await.unwrap();
        h.handle.start().await.unwrap();
        wait_until(&h.handle, |s| s.enrolled == 1).await;

        h.store.delete_identity(&ana.id).await.unwrap();
        *h.script.lock().unwrap() = vec![face([0.0, 0.0])];

        let snap = wait_until(&h.handle, |s| s.enrolled == 0).await;
        assert!(snap.storage_fault.is_none());
        assert!(h.store.attendance_by_identity(&ana.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detection_errors_skip_frames_only() {
        let h = harness(false).await;
        let ana = h.store.enroll("Ana", Embedding::new(vec![0.0, 0.0])).await.unwrap();
        *h.script.lock().unwrap() = vec![face([0.0, 0.0])];
        h.failures.store(5, Ordering::SeqCst);

        h.handle.start().await.unwrap();
        let snap = wait_until(&h.handle, |_| h.failures.load(Ordering::SeqCst) == 0).await;
        assert_eq!(snap.state, LoopState::Active);
        assert!(h.frames.load(Ordering::SeqCst) >= 5);

        // The first good frame after the failures records attendance.
        let snap = wait_until(&h.handle, |s| !s.recognized.is_empty()).await;
        assert_eq!(snap.state, LoopState::Active);
        assert!(snap.storage_fault.is_none());
        assert_eq!(h.store.attendance_by_identity(&ana.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_disables_writes_for_session() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("attendance.db");
        let h = harness_with(false, Store::open(&db, 2).await.unwrap(), Duration::from_millis(5)).await;
        let ana = h.store.enroll("Ana", Embedding::new(vec![0.0, 0.0])).await.unwrap();

        h.handle.start().await.unwrap();
        wait_until(&h.handle, |s| s.state == LoopState::Active && s.enrolled == 1).await;

        // Break the attendance table underneath the loop.
        let side = rusqlite::Connection::open(&db).unwrap();
        side.busy_timeout(Duration::from_secs(5)).unwrap();
        side.execute_batch("ALTER TABLE attendance RENAME TO attendance_hidden").unwrap();

        *h.script.lock().unwrap() = vec![face([0.0, 0.0])];
        let snap = wait_until(&h.handle, |s| s.storage_fault.is_some()).await;
        assert_eq!(snap.state, LoopState::Active);

        // Even with the table back, nothing more is written this session.
        side.execute_batch("ALTER TABLE attendance_hidden RENAME TO attendance").unwrap();
        let seen = h.frames.load(Ordering::SeqCst);
        let snap = wait_until(&h.handle, |s| {
            !s.recognized.is_empty() && h.frames.load(Ordering::SeqCst) > seen + 5
        })
        .await;
        assert!(snap.storage_fault.is_some());
        assert!(h.store.attendance_by_identity(&ana.id).await.unwrap().is_empty());

        *h.script.lock().unwrap() = vec![face([5.0, 5.0])];
        let snap = wait_until(&h.handle, |s| !s.unknown.is_empty()).await;
        h.handle.select_unknown(snap.unknown[0].id).await.unwrap();
        let err = h.handle.enroll_selected("Luis").await.unwrap_err();
        assert!(matches!(err, LoopError::StorageDisabled(_)));
        assert!(!err.is_validation());
        assert_eq!(h.handle.snapshot().state, LoopState::Paused);
        assert_eq!(h.store.count_identities().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_frames_respect_min_interval() {
        let interval = Duration::from_millis(40);
        let window = Duration::from_millis(400);
        let h = harness_with(false, Store::open_in_memory(2).await.unwrap(), interval).await;

        h.handle.start().await.unwrap();
        wait_until(&h.handle, |_| h.frames.load(Ordering::SeqCst) >= 1).await;
        let before = h.frames.load(Ordering::SeqCst);
        tokio::time::sleep(window).await;
        let processed = h.frames.load(Ordering::SeqCst) - before;

        let ceiling = (window.as_millis() / interval.as_millis()) as usize + 1;
        assert!(processed <= ceiling, "{processed} frames in {window:?}");
        assert!(processed >= 2, "loop stalled: {processed} frames in {window:?}");
        assert!(h.handle.snapshot().fps <= 1000 / 40 + 1);
    }
}
