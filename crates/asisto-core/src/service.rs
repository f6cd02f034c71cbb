//! Descriptor extraction and matching service.
//!
//! `FaceService` owns the model lifecycle: the first `load_models()` call
//! spawns the only load task, every concurrent or later caller waits on its
//! outcome. A failed load stays failed until `reload_models()` is invoked.

use crate::detector::DetectorError;
use crate::matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_THRESHOLD};
use crate::model::{FaceAnalyzer, LoadProgress, ModelLoader};
use crate::recognizer::RecognizerError;
use crate::types::{Detection, Embedding, EnrolledIdentity};
use image::RgbImage;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;

/// The model bundle could not be made ready. Fatal for the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelLoadError {
    #[error("model artifact {artifact} unavailable (primary: {primary}, fallback: {fallback})")]
    Unavailable {
        artifact: String,
        primary: String,
        fallback: String,
    },
    #[error("failed to initialise {artifact}: {reason}")]
    Init { artifact: String, reason: String },
    #[error("http client: {0}")]
    Client(String),
    #[error("model load task aborted")]
    Aborted,
}

/// A single frame could not be analyzed. Transient: skip the frame.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("frame is empty")]
    EmptyFrame,
    #[error("models not available: {0}")]
    Models(#[from] ModelLoadError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("analysis task failed: {0}")]
    Task(String),
}

type SharedAnalyzer = Arc<Mutex<Box<dyn FaceAnalyzer>>>;
type LoadOutcome = Result<SharedAnalyzer, ModelLoadError>;

enum LoadState {
    Idle,
    Loading(watch::Receiver<Option<LoadOutcome>>),
    Ready(SharedAnalyzer),
    Failed(ModelLoadError),
}

/// Coarse load status for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    NotLoaded,
    Loading { progress: u8 },
    Ready,
    Failed(ModelLoadError),
}

pub struct FaceService {
    loader: Arc<dyn ModelLoader>,
    state: Arc<Mutex<LoadState>>,
    progress: LoadProgress,
    threshold_bits: AtomicU32,
    matcher: EuclideanMatcher,
}

fn lock(state: &Mutex<LoadState>) -> MutexGuard<'_, LoadState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FaceService {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            state: Arc::new(Mutex::new(LoadState::Idle)),
            progress: LoadProgress::default(),
            threshold_bits: AtomicU32::new(DEFAULT_THRESHOLD.to_bits()),
            matcher: EuclideanMatcher,
        }
    }

    /// Make the model bundle ready. Idempotent and safe to call concurrently:
    /// all callers share one load. A previous failure is returned as-is.
    pub async fn load_models(&self) -> Result<(), ModelLoadError> {
        self.analyzer().await.map(|_| ())
    }

    /// Explicit retry after a failed (or aborted) load. No-op while a load is
    /// in flight or once the models are ready.
    pub async fn reload_models(&self) -> Result<(), ModelLoadError> {
        {
            let mut state = lock(&self.state);
            let restart = match &*state {
                LoadState::Failed(_) => true,
                LoadState::Loading(rx) => rx.has_changed().is_err(),
                LoadState::Idle | LoadState::Ready(_) => false,
            };
            if restart {
                tracing::info!("reloading face models");
                self.progress.set(0);
                *state = LoadState::Idle;
            }
        }
        self.load_models().await
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*lock(&self.state), LoadState::Ready(_))
    }

    pub fn status(&self) -> ModelStatus {
        match &*lock(&self.state) {
            LoadState::Idle => ModelStatus::NotLoaded,
            LoadState::Loading(_) => ModelStatus::Loading { progress: self.progress.get() },
            LoadState::Ready(_) => ModelStatus::Ready,
            LoadState::Failed(e) => ModelStatus::Failed(e.clone()),
        }
    }

    pub fn load_progress(&self) -> u8 {
        self.progress.get()
    }

    async fn analyzer(&self) -> Result<SharedAnalyzer, ModelLoadError> {
        let mut rx = {
            let mut state = lock(&self.state);
            match &*state {
                LoadState::Ready(analyzer) => return Ok(analyzer.clone()),
                LoadState::Failed(e) => return Err(e.clone()),
                LoadState::Loading(rx) => rx.clone(),
                LoadState::Idle => {
                    let rx = self.spawn_load();
                    *state = LoadState::Loading(rx.clone());
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(ModelLoadError::Aborted))
    }

    fn spawn_load(&self) -> watch::Receiver<Option<LoadOutcome>> {
        let (tx, rx) = watch::channel(None);
        let loader = self.loader.clone();
        let state = self.state.clone();
        let progress = self.progress.clone();

        tokio::spawn(async move {
            tracing::info!("loading face models");
            let outcome: LoadOutcome = loader
                .load(&progress)
                .await
                .map(|analyzer| Arc::new(Mutex::new(analyzer)));

            *lock(&state) = match &outcome {
                Ok(analyzer) => {
                    progress.set(100);
                    tracing::info!("face models ready");
                    LoadState::Ready(analyzer.clone())
                }
                Err(e) => {
                    tracing::error!(error = %e, "face model load failed");
                    LoadState::Failed(e.clone())
                }
            };
            tx.send_replace(Some(outcome));
        });

        rx
    }

    /// Detect faces and extract their descriptors. Zero faces is `Ok(vec![])`.
    pub async fn detect_faces(&self, frame: RgbImage) -> Result<Vec<Detection>, DetectionError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(DetectionError::EmptyFrame);
        }
        let analyzer = self.analyzer().await?;

        tokio::task::spawn_blocking(move || {
            let mut analyzer = analyzer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            analyzer.analyze(&frame)
        })
        .await
        .map_err(|e| DetectionError::Task(e.to_string()))?
    }

    /// Descriptor of the most confident face in the frame, if any has one.
    pub async fn extract_descriptor(&self, frame: RgbImage) -> Result<Option<Detection>, DetectionError> {
        let detections = self.detect_faces(frame).await?;
        Ok(detections
            .into_iter()
            .filter(|d| d.descriptor.is_some())
            .max_by(|a, b| a.confidence().total_cmp(&b.confidence())))
    }

    /// Match a probe descriptor against the enrolled set with the current threshold.
    pub fn match_descriptor(&self, descriptor: &Embedding, enrolled: &[EnrolledIdentity]) -> MatchResult {
        self.matcher.compare(descriptor, enrolled, self.threshold())
    }

    /// Set the acceptance threshold, clamped to [0, 1]. Returns the value applied.
    pub fn set_threshold(&self, threshold: f32) -> f32 {
        let clamped = if threshold.is_nan() { DEFAULT_THRESHOLD } else { threshold.clamp(0.0, 1.0) };
        if clamped != threshold {
            tracing::warn!(requested = threshold, applied = clamped, "recognition threshold out of range");
        }
        self.threshold_bits.store(clamped.to_bits(), Ordering::Relaxed);
        clamped
    }

    pub fn threshold(&self) -> f32 {
        f32::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LoadFuture;
    use crate::types::BoundingBox;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FixedAnalyzer(Vec<Detection>);

    impl FaceAnalyzer for FixedAnalyzer {
        fn analyze(&mut self, _frame: &RgbImage) -> Result<Vec<Detection>, DetectionError> {
            Ok(self.0.clone())
        }
    }

    struct CountingLoader {
        calls: AtomicUsize,
        fail: bool,
        detections: Vec<Detection>,
    }

    impl CountingLoader {
        fn new(fail: bool, detections: Vec<Detection>) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail, detections })
        }
    }

    impl ModelLoader for CountingLoader {
        fn load<'a>(&'a self, progress: &'a LoadProgress) -> LoadFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                progress.set(50);
                tokio::time::sleep(Duration::from_millis(30)).await;
                if self.fail {
                    return Err(ModelLoadError::Unavailable {
                        artifact: "det_10g.onnx".into(),
                        primary: "<none>".into(),
                        fallback: "/nowhere".into(),
                    });
                }
                Ok(Box::new(FixedAnalyzer(self.detections.clone())) as Box<dyn FaceAnalyzer>)
            })
        }
    }

    fn face(confidence: f32, descriptor: Option<Vec<f32>>) -> Detection {
        Detection {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 120.0,
                height: 120.0,
                confidence,
                landmarks: None,
            },
            descriptor: descriptor.map(Embedding::new),
        }
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_attempt() {
        let loader = CountingLoader::new(false, vec![]);
        let service = FaceService::new(loader.clone());

        let (a, b, c) = tokio::join!(service.load_models(), service.load_models(), service.load_models());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(service.is_loaded());
        assert_eq!(service.load_progress(), 100);

        service.load_models().await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_cached_until_reload() {
        let loader = CountingLoader::new(true, vec![]);
        let service = FaceService::new(loader.clone());

        let (a, b) = tokio::join!(service.load_models(), service.load_models());
        assert!(matches!(a, Err(ModelLoadError::Unavailable { .. })));
        assert_eq!(a, b);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        assert!(service.load_models().await.is_err());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(service.status(), ModelStatus::Failed(_)));

        assert!(service.reload_models().await.is_err());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reload_is_noop_when_ready() {
        let loader = CountingLoader::new(false, vec![]);
        let service = FaceService::new(loader.clone());
        service.load_models().await.unwrap();
        service.reload_models().await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detect_faces_loads_on_demand() {
        let loader = CountingLoader::new(false, vec![face(0.9, Some(vec![0.1, 0.2]))]);
        let service = FaceService::new(loader.clone());

        let detections = service.detect_faces(RgbImage::new(8, 8)).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detect_faces_no_faces_is_ok() {
        let service = FaceService::new(CountingLoader::new(false, vec![]));
        assert!(service.detect_faces(RgbImage::new(8, 8)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detect_faces_rejects_empty_frame() {
        let loader = CountingLoader::new(false, vec![]);
        let service = FaceService::new(loader.clone());
        let result = service.detect_faces(RgbImage::new(0, 0)).await;
        assert!(matches!(result, Err(DetectionError::EmptyFrame)));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_extract_descriptor_picks_most_confident_with_descriptor() {
        let loader = CountingLoader::new(
            false,
            vec![
                face(0.99, None),
                face(0.7, Some(vec![1.0])),
                face(0.8, Some(vec![2.0])),
            ],
        );
        let service = FaceService::new(loader);
        let best = service.extract_descriptor(RgbImage::new(4, 4)).await.unwrap().unwrap();
        assert_eq!(best.descriptor, Some(Embedding::new(vec![2.0])));
    }

    #[test]
    fn test_threshold_clamped() {
        let service = FaceService::new(CountingLoader::new(false, vec![]));
        assert_eq!(service.threshold(), DEFAULT_THRESHOLD);
        assert_eq!(service.set_threshold(1.7), 1.0);
        assert_eq!(service.set_threshold(-0.2), 0.0);
        assert_eq!(service.set_threshold(0.45), 0.45);
        assert_eq!(service.threshold(), 0.45);
    }

    #[test]
    fn test_match_uses_current_threshold() {
        let service = FaceService::new(CountingLoader::new(false, vec![]));
        let gallery = vec![EnrolledIdentity {
            id: "1".into(),
            display_name: "Ana".into(),
            short_code: "ANA2024".into(),
            embedding: Embedding::new(vec![0.0, 0.0]),
            created_at: chrono::Utc::now(),
            last_seen_at: None,
        }];
        let probe = Embedding::new(vec![0.5, 0.0]);

        assert!(service.match_descriptor(&probe, &gallery).matched);
        service.set_threshold(0.3);
        assert!(!service.match_descriptor(&probe, &gallery).matched);
    }
}
