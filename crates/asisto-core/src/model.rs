//! Model bundle: fetching the ONNX artifacts and turning them into a face analyzer.
//!
//! Artifacts are looked up in the cache directory first, then downloaded
//! from the primary remote base URL, then taken from the locally bundled
//! fallback directory.

use crate::detector::FaceDetector;
use crate::recognizer::FaceRecognizer;
use crate::service::{DetectionError, ModelLoadError};
use crate::types::Detection;
use image::RgbImage;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DETECTOR_ARTIFACT: &str = "det_10g.onnx";
pub const RECOGNIZER_ARTIFACT: &str = "w600k_r50.onnx";

/// Smallest plausible ONNX artifact; anything shorter is an error page or truncated.
const MIN_ARTIFACT_BYTES: usize = 1024;

/// Turns a frame into detections with descriptors.
///
/// Implementations are synchronous; callers run them on a blocking thread.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, DetectionError>;
}

pub type LoadFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Box<dyn FaceAnalyzer>, ModelLoadError>> + Send + 'a>>;

/// Produces a ready-to-use analyzer, reporting progress as it goes.
pub trait ModelLoader: Send + Sync {
    fn load<'a>(&'a self, progress: &'a LoadProgress) -> LoadFuture<'a>;
}

/// Shared 0..=100 load progress indicator.
#[derive(Debug, Clone, Default)]
pub struct LoadProgress(Arc<AtomicU8>);

impl LoadProgress {
    pub fn set(&self, percent: u8) {
        self.0.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Where model artifacts come from.
#[derive(Debug, Clone)]
pub struct ModelSource {
    /// Remote base URL; artifacts are fetched from `{primary_url}/{artifact}`.
    pub primary_url: Option<String>,
    /// Locally bundled artifacts used when the primary source is unreachable.
    pub fallback_dir: PathBuf,
    /// Downloaded artifacts are stored and reused from here.
    pub cache_dir: PathBuf,
    pub download_timeout: Duration,
}

/// SCRFD detection followed by ArcFace extraction for every face with landmarks.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, DetectionError> {
        let faces = self.detector.detect(frame)?;

        faces
            .into_iter()
            .map(|bbox| {
                let descriptor = match bbox.landmarks {
                    Some(_) => Some(self.recognizer.extract(frame, &bbox)?),
                    None => None,
                };
                Ok(Detection { bbox, descriptor })
            })
            .collect()
    }
}

/// Loads the SCRFD + ArcFace bundle.
pub struct OnnxModelLoader {
    source: ModelSource,
    client: reqwest::Client,
}

impl OnnxModelLoader {
    pub fn new(source: ModelSource) -> Result<Self, ModelLoadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(source.download_timeout)
            .build()
            .map_err(|e| ModelLoadError::Client(e.to_string()))?;
        Ok(Self { source, client })
    }

    /// Resolve one artifact to a local file path.
    async fn resolve(&self, artifact: &str) -> Result<PathBuf, ModelLoadError> {
        let cached = self.source.cache_dir.join(artifact);
        if cached.exists() {
            tracing::debug!(path = %cached.display(), "using cached model artifact");
            return Ok(cached);
        }

        if let Some(base) = &self.source.primary_url {
            let url = format!("{}/{artifact}", base.trim_end_matches('/'));
            match self.download(&url, &cached).await {
                Ok(bytes) => {
                    tracing::info!(%url, bytes, "downloaded model artifact");
                    return Ok(cached);
                }
                Err(reason) => {
                    tracing::warn!(%url, %reason, "primary model source unavailable, trying local bundle");
                }
            }
        }

        let local = self.source.fallback_dir.join(artifact);
        if local.exists() {
            tracing::info!(path = %local.display(), "using bundled model artifact");
            return Ok(local);
        }

        Err(ModelLoadError::Unavailable {
            artifact: artifact.to_string(),
            primary: self.source.primary_url.clone().unwrap_or_else(|| "<none>".to_string()),
            fallback: self.source.fallback_dir.display().to_string(),
        })
    }

    /// Download `url` into `dest`, writing through a temporary file so a
    /// failed transfer never leaves a truncated artifact in the cache.
    async fn download(&self, url: &str, dest: &Path) -> Result<usize, String> {
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        if bytes.len() < MIN_ARTIFACT_BYTES {
            return Err(format!("artifact suspiciously small ({} bytes)", bytes.len()));
        }

        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| e.to_string())?;
        }
        let partial = dest.with_extension("onnx.part");
        tokio::fs::write(&partial, &bytes).await.map_err(|e| e.to_string())?;
        tokio::fs::rename(&partial, dest).await.map_err(|e| e.to_string())?;
        Ok(bytes.len())
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load<'a>(&'a self, progress: &'a LoadProgress) -> LoadFuture<'a> {
        Box::pin(async move {
            progress.set(10);
            let detector_path = self.resolve(DETECTOR_ARTIFACT).await?;
            progress.set(40);
            let recognizer_path = self.resolve(RECOGNIZER_ARTIFACT).await?;
            progress.set(70);

            let analyzer = tokio::task::spawn_blocking(move || {
                let detector = FaceDetector::load(&detector_path).map_err(|e| ModelLoadError::Init {
                    artifact: DETECTOR_ARTIFACT.to_string(),
                    reason: e.to_string(),
                })?;
                let recognizer =
                    FaceRecognizer::load(&recognizer_path).map_err(|e| ModelLoadError::Init {
                        artifact: RECOGNIZER_ARTIFACT.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok::<_, ModelLoadError>(OnnxAnalyzer { detector, recognizer })
            })
            .await
            .map_err(|_| ModelLoadError::Aborted)??;

            progress.set(95);
            Ok(Box::new(analyzer) as Box<dyn FaceAnalyzer>)
        })
    }
}
