use asisto_core::{ModelSource, ARCFACE_EMBEDDING_DIM, DEFAULT_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file, then `ASISTO_*`
/// environment variables (highest precedence).
///
/// # Models
///
/// There is no default `model_url`; out of the box the models are read from
/// `model_cache_dir` and then `model_fallback_dir`. To enable downloads, point
/// `model_url` at a base URL serving `det_10g.onnx` and `w600k_r50.onnx` side
/// by side (an unpacked InsightFace `buffalo_l` bundle, mirrored on a host you
/// control). The loader requests `{model_url}/{artifact}`.
///
/// # Threshold
///
/// Descriptors are unit length, so a Euclidean distance `d` corresponds to a
/// cosine similarity of `1 - d²/2`:
///
/// | threshold | cosine |
/// |-----------|--------|
/// | 0.6       | 0.82   |
/// | 0.8       | 0.68   |
/// | 0.9       | 0.60   |
/// | 1.0       | 0.50   |
///
/// The default 0.6 rarely produces false matches but can miss the same person
/// under different lighting or pose. If enrolled people keep showing up as
/// unknown faces, raise it in steps of 0.05. The confidence `asisto status`
/// prints for a recognized face is `1 - distance`. Values are clamped to `[0, 1]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Remote base URL the model artifacts are downloaded from.
    pub model_url: Option<String>,
    /// Locally bundled model artifacts, used when the remote is unreachable.
    pub model_fallback_dir: PathBuf,
    /// Downloaded artifacts are kept here.
    pub model_cache_dir: PathBuf,
    pub model_download_timeout_secs: u64,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum descriptor distance accepted as a match. See [`Config`] for tuning.
    pub threshold: f32,
    /// Minimum time between two processed frames.
    pub min_frame_interval_ms: u64,
    /// Minimum time between two `last_seen_at` refreshes of one identity.
    pub last_seen_interval_secs: u64,
    pub descriptor_dim: usize,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = xdg_dir("XDG_DATA_HOME", ".local/share").join("asisto");
        let cache_dir = xdg_dir("XDG_CACHE_HOME", ".cache").join("asisto");

        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_url: None,
            model_fallback_dir: PathBuf::from("/usr/share/asisto/models"),
            model_cache_dir: cache_dir.join("models"),
            model_download_timeout_secs: 30,
            db_path: data_dir.join("attendance.db"),
            threshold: DEFAULT_THRESHOLD,
            min_frame_interval_ms: 50,
            last_seen_interval_secs: 60,
            descriptor_dim: ARCFACE_EMBEDDING_DIM,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file named by
    /// `ASISTO_CONFIG` (or `$XDG_CONFIG_HOME/asisto/asistod.toml` if it
    /// exists), then `ASISTO_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("ASISTO_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(|| {
            xdg_dir("XDG_CONFIG_HOME", ".config").join("asisto/asistod.toml")
        });

        let mut config = if explicit.is_some() || path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Override fields from environment variables. Unparseable values are
    /// ignored with a warning.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ASISTO_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("ASISTO_MODEL_URL") {
            self.model_url = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = var("ASISTO_MODEL_FALLBACK_DIR") {
            self.model_fallback_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ASISTO_MODEL_CACHE_DIR") {
            self.model_cache_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ASISTO_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("ASISTO_BUS") {
            match v.as_str() {
                "session" => self.bus = BusKind::Session,
                "system" => self.bus = BusKind::System,
                other => tracing::warn!(value = other, "ignoring ASISTO_BUS"),
            }
        }

        parse_into(&var, "ASISTO_CAMERA_WIDTH", &mut self.camera_width);
        parse_into(&var, "ASISTO_CAMERA_HEIGHT", &mut self.camera_height);
        parse_into(&var, "ASISTO_MODEL_DOWNLOAD_TIMEOUT_SECS", &mut self.model_download_timeout_secs);
        parse_into(&var, "ASISTO_THRESHOLD", &mut self.threshold);
        parse_into(&var, "ASISTO_MIN_FRAME_INTERVAL_MS", &mut self.min_frame_interval_ms);
        parse_into(&var, "ASISTO_LAST_SEEN_INTERVAL_SECS", &mut self.last_seen_interval_secs);
        parse_into(&var, "ASISTO_DESCRIPTOR_DIM", &mut self.descriptor_dim);
    }

    pub fn model_source(&self) -> ModelSource {
        ModelSource {
            primary_url: self.model_url.clone(),
            fallback_dir: self.model_fallback_dir.clone(),
            cache_dir: self.model_cache_dir.clone(),
            download_timeout: Duration::from_secs(self.model_download_timeout_secs),
        }
    }

    pub fn min_frame_interval(&self) -> Duration {
        Duration::from_millis(self.min_frame_interval_ms)
    }

    pub fn last_seen_interval(&self) -> Duration {
        Duration::from_secs(self.last_seen_interval_secs)
    }
}

fn xdg_dir(var: &str, home_relative: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(home_relative)
    })
}

fn parse_into<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *target = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}
