//! Gate configuration: built-in defaults, an optional TOML file, then
//! `FACEGATE_*` environment overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Gate configuration: defaults, then an optional TOML file named by
/// `FACEGATE_CONFIG`, then `FACEGATE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend endpoint receiving `{"embedding": [...]}`.
    pub api_url: String,
    /// Minimum seconds between two dispatches for the same identity.
    pub cooldown_secs: u64,
    /// Maximum cosine distance (exclusive) accepted as a match.
    pub recognition_threshold: f32,
    /// Minimum detector confidence (inclusive) for a face to be encoded.
    pub confidence_threshold: f32,
    /// Square side of the encoder input.
    pub encoder_input_size: u32,
    /// Timeout for one dispatch request.
    pub request_timeout_secs: u64,
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub encoder_model: String,
    /// Path to the SQLite identity database.
    pub db_path: PathBuf,
    /// Frames discarded at startup while the camera settles exposure.
    pub warmup_frames: usize,
    /// Where annotated frames are written; `None` logs annotations only.
    pub snapshot_path: Option<PathBuf>,
}

/// Keys accepted in the TOML config file. All optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    api_url: Option<String>,
    cooldown_secs: Option<u64>,
    recognition_threshold: Option<f32>,
    confidence_threshold: Option<f32>,
    encoder_input_size: Option<u32>,
    request_timeout_secs: Option<u64>,
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    detector_model: Option<String>,
    encoder_model: Option<String>,
    db_path: Option<PathBuf>,
    warmup_frames: Option<usize>,
    snapshot_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            api_url: "http://localhost:3000/api/gate/screen".to_string(),
            cooldown_secs: 50,
            recognition_threshold: 0.2,
            confidence_threshold: 0.99,
            encoder_input_size: 160,
            request_timeout_secs: 5,
            camera_device: "/dev/video0".to_string(),
            model_dir: data_dir.join("models"),
            detector_model: "version-RFB-320.onnx".to_string(),
            encoder_model: "facenet.onnx".to_string(),
            db_path: data_dir.join("faces.db"),
            warmup_frames: 4,
            snapshot_path: None,
        }
    }
}

impl Config {
    /// Load defaults, the `FACEGATE_CONFIG` file if set, then env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("FACEGATE_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay values from a TOML file.
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        self.apply_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "applied config file");
        Ok(())
    }

    fn apply_toml(&mut self, text: &str) -> Result<(), toml::de::Error> {
        let file: ConfigFile = toml::from_str(text)?;
        let defaults = std::mem::take(self);
        *self = Config {
            api_url: file.api_url.unwrap_or(defaults.api_url),
            cooldown_secs: file.cooldown_secs.unwrap_or(defaults.cooldown_secs),
            recognition_threshold: file
                .recognition_threshold
                .unwrap_or(defaults.recognition_threshold),
            confidence_threshold: file
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            encoder_input_size: file.encoder_input_size.unwrap_or(defaults.encoder_input_size),
            request_timeout_secs: file
                .request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
            camera_device: file.camera_device.unwrap_or(defaults.camera_device),
            model_dir: file.model_dir.unwrap_or(defaults.model_dir),
            detector_model: file.detector_model.unwrap_or(defaults.detector_model),
            encoder_model: file.encoder_model.unwrap_or(defaults.encoder_model),
            db_path: file.db_path.unwrap_or(defaults.db_path),
            warmup_frames: file.warmup_frames.unwrap_or(defaults.warmup_frames),
            snapshot_path: file.snapshot_path.or(defaults.snapshot_path),
        };
        Ok(())
    }

    /// Overlay `FACEGATE_*` variables. Unparseable values are ignored.
    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|v| v.parse().ok())
        }

        if let Some(v) = get("FACEGATE_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = parsed(get("FACEGATE_COOLDOWN_SECS")) {
            self.cooldown_secs = v;
        }
        if let Some(v) = parsed(get("FACEGATE_RECOGNITION_THRESHOLD")) {
            self.recognition_threshold = v;
        }
        if let Some(v) = parsed(get("FACEGATE_CONFIDENCE_THRESHOLD")) {
            self.confidence_threshold = v;
        }
        if let Some(v) = parsed(get("FACEGATE_ENCODER_INPUT_SIZE")) {
            self.encoder_input_size = v;
        }
        if let Some(v) = parsed(get("FACEGATE_REQUEST_TIMEOUT_SECS")) {
            self.request_timeout_secs = v;
        }
        if let Some(v) = get("FACEGATE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = get("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("FACEGATE_DETECTOR_MODEL") {
            self.detector_model = v;
        }
        if let Some(v) = get("FACEGATE_ENCODER_MODEL") {
            self.encoder_model = v;
        }
        if let Some(v) = get("FACEGATE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = parsed(get("FACEGATE_WARMUP_FRAMES")) {
            self.warmup_frames = v;
        }
        if let Some(v) = get("FACEGATE_SNAPSHOT_PATH") {
            self.snapshot_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
    }

    pub fn cooldown_window(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn encoder_model_path(&self) -> String {
        self.model_dir
            .join(&self.encoder_model)
            .to_string_lossy()
            .into_owned()
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_url, "http://localhost:3000/api/gate/screen");
        assert_eq!(config.cooldown_window(), Duration::from_secs(50));
        assert!((config.recognition_threshold - 0.2).abs() < 1e-6);
        assert!((config.confidence_threshold - 0.99).abs() < 1e-6);
        assert_eq!(config.encoder_input_size, 160);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert!(config.db_path.ends_with("facegate/faces.db"));
        assert!(config.snapshot_path.is_none());
    }

    #[test]
    fn test_toml_overlay() {
        let mut config = Config::default();
        config
            .apply_toml(
                r#"
                api_url = "http://gate.local/api/gate/screen"
                cooldown_secs = 300
                snapshot_path = "/tmp/gate.jpg"
                "#,
            )
            .unwrap();
        assert_eq!(config.api_url, "http://gate.local/api/gate/screen");
        assert_eq!(config.cooldown_secs, 300);
        assert_eq!(config.snapshot_path, Some(PathBuf::from("/tmp/gate.jpg")));
        assert_eq!(config.encoder_input_size, 160);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        let mut config = Config::default();
        assert!(config.apply_toml("cooldown = 3").is_err());
    }

    #[test]
    fn test_env_overlay_ignores_garbage() {
        let env: HashMap<&str, &str> = [
            ("FACEGATE_COOLDOWN_SECS", "10"),
            ("FACEGATE_RECOGNITION_THRESHOLD", "not-a-number"),
            ("FACEGATE_CAMERA_DEVICE", "/dev/video4"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.cooldown_secs, 10);
        assert!((config.recognition_threshold - 0.2).abs() < 1e-6);
        assert_eq!(config.camera_device, "/dev/video4");
    }

    #[test]
    fn test_env_overrides_model_files() {
        let env: HashMap<&str, &str> = [
            ("FACEGATE_MODEL_DIR", "/srv/gate"),
            ("FACEGATE_DETECTOR_MODEL", "version-RFB-640.onnx"),
            ("FACEGATE_ENCODER_MODEL", "facenet512.onnx"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.detector_model_path(), "/srv/gate/version-RFB-640.onnx");
        assert_eq!(config.encoder_model_path(), "/srv/gate/facenet512.onnx");
    }

    #[test]
    fn test_model_paths() {
        let mut config = Config::default();
        config.model_dir = PathBuf::from("/opt/models");
        assert_eq!(config.detector_model_path(), "/opt/models/version-RFB-320.onnx");
        assert_eq!(config.encoder_model_path(), "/opt/models/facenet.onnx");
    }
}
