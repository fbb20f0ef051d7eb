use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DETECTOR_MODEL: &str = "det_10g.onnx";
const EMBEDDER_MODEL: &str = "w600k_r50.onnx";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("threshold {0} outside [-1, 1]")]
    ThresholdOutOfRange(f32),
    #[error("debounce must be at least one second")]
    ZeroDebounce,
    #[error("intra-op thread count must be positive")]
    ZeroThreads,
}

/// Engine configuration, loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Database root: one subdirectory per identity.
    pub db_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Minimum cosine similarity for a positive match.
    pub threshold: f32,
    /// Quiet period before a hot reload.
    pub debounce_secs: u64,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
}

impl Config {
    /// Load configuration from `FACEWATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facewatch");

        fn parsed<T: std::str::FromStr>(
            var: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            var(key).and_then(|v| v.trim().parse().ok())
        }

        Self {
            db_dir: var("FACEWATCH_DB_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("db")),
            model_dir: var("FACEWATCH_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models")),
            threshold: parsed(&var, "FACEWATCH_THRESHOLD").unwrap_or(0.4),
            debounce_secs: parsed(&var, "FACEWATCH_DEBOUNCE_SECS").unwrap_or(3),
            intra_threads: parsed(&var, "FACEWATCH_INTRA_THREADS").unwrap_or(2),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.threshold));
        }
        if self.debounce_secs == 0 {
            return Err(ConfigError::ZeroDebounce);
        }
        if self.intra_threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(DETECTOR_MODEL)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join(EMBEDDER_MODEL)
            .to_string_lossy()
            .into_owned()
    }
}
