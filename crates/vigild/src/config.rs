use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vigil_core::labels::{self, DirectorySource};

use crate::notify::EmailSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by `VIGIL_CONFIG`,
/// then `VIGIL_*` environment variables (highest precedence).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Frames discarded at startup while exposure settles.
    pub warmup_frames: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// SQLite database holding the recognition log and blacklist.
    pub db_path: PathBuf,
    /// JSON id → name label map.
    pub labels_path: PathBuf,
    /// Dataset folder (one sub-directory per person). Takes precedence over
    /// `labels_path` when set.
    pub dataset_dir: Option<PathBuf>,
    /// Enrolled reference embeddings.
    pub gallery_path: PathBuf,
    /// Distance below which a match is accepted.
    pub confidence_threshold: f32,
    pub alert_cooldown_secs: u64,
    pub alert_timeout_ms: u64,
    /// Alerts are POSTed here when set.
    pub webhook_url: Option<String>,
    /// SMTP relay for alert mail. Mail is sent only when both this and
    /// `alert_email_to` are set.
    pub smtp_host: Option<String>,
    /// Submission port; the session is upgraded with STARTTLS.
    pub smtp_port: u16,
    /// Login user, also used as the sender address.
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    pub alert_email_to: Option<String>,
    /// Listen address of the stream/event HTTP server.
    pub http_addr: String,
    pub jpeg_quality: u8,
    /// Register on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".into(),
            camera_width: 640,
            camera_height: 480,
            warmup_frames: 4,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("vigil.db"),
            labels_path: data_dir.join("label_map.json"),
            dataset_dir: None,
            gallery_path: data_dir.join("gallery.json"),
            confidence_threshold: vigil_core::policy::DEFAULT_CONFIDENCE_THRESHOLD,
            alert_cooldown_secs: vigil_core::throttle::DEFAULT_COOLDOWN.as_secs(),
            alert_timeout_ms: 2000,
            webhook_url: None,
            smtp_host: None,
            smtp_port: 587,
            smtp_user: None,
            smtp_pass: None,
            alert_email_to: None,
            http_addr: "0.0.0.0:5000".into(),
            jpeg_quality: vigil_core::stream::DEFAULT_JPEG_QUALITY,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load from `VIGIL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var_os("VIGIL_CONFIG").map(PathBuf::from);
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    pub fn from_sources(
        file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        let path = |key: &str| env(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        if let Some(device) = env("VIGIL_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        env_parse(env, "VIGIL_CAMERA_WIDTH", &mut self.camera_width);
        env_parse(env, "VIGIL_CAMERA_HEIGHT", &mut self.camera_height);
        env_parse(env, "VIGIL_WARMUP_FRAMES", &mut self.warmup_frames);
        if let Some(dir) = path("VIGIL_MODEL_DIR") {
            self.model_dir = dir;
        }
        if let Some(db) = path("VIGIL_DB_PATH") {
            self.db_path = db;
        }
        if let Some(labels) = path("VIGIL_LABELS_PATH") {
            self.labels_path = labels;
        }
        if let Some(dataset) = path("VIGIL_DATASET_DIR") {
            self.dataset_dir = Some(dataset);
        }
        if let Some(gallery) = path("VIGIL_GALLERY_PATH") {
            self.gallery_path = gallery;
        }
        env_parse(env, "VIGIL_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        env_parse(env, "VIGIL_ALERT_COOLDOWN_SECS", &mut self.alert_cooldown_secs);
        env_parse(env, "VIGIL_ALERT_TIMEOUT_MS", &mut self.alert_timeout_ms);
        if let Some(url) = env("VIGIL_WEBHOOK_URL") {
            self.webhook_url = Some(url).filter(|u| !u.is_empty());
        }
        let text = |key: &str| env(key).filter(|v| !v.is_empty());
        if let Some(host) = text("VIGIL_SMTP_HOST") {
            self.smtp_host = Some(host);
        }
        env_parse(env, "VIGIL_SMTP_PORT", &mut self.smtp_port);
        if let Some(user) = text("VIGIL_SMTP_USER") {
            self.smtp_user = Some(user);
        }
        if let Some(pass) = text("VIGIL_SMTP_PASS") {
            self.smtp_pass = Some(pass);
        }
        if let Some(to) = text("VIGIL_ALERT_EMAIL_TO") {
            self.alert_email_to = Some(to);
        }
        if let Some(addr) = env("VIGIL_HTTP_ADDR") {
            self.http_addr = addr;
        }
        env_parse(env, "VIGIL_JPEG_QUALITY", &mut self.jpeg_quality);
        if let Some(flag) = env("VIGIL_SESSION_BUS") {
            self.session_bus = flag != "0";
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.confidence_threshold.is_finite() && self.confidence_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                key: "confidence_threshold",
                reason: format!("must be a positive number, got {}", self.confidence_threshold),
            });
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid {
                key: "jpeg_quality",
                reason: format!("must be within 1..=100, got {}", self.jpeg_quality),
            });
        }
        if self.alert_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "alert_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.smtp_port == 0 {
            return Err(ConfigError::Invalid {
                key: "smtp_port",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Mail transport settings, or `None` when alert mail is not configured.
    pub fn email(&self) -> Option<EmailSettings> {
        let host = self.smtp_host.clone()?;
        let to = self.alert_email_to.clone()?;
        let credentials = match (&self.smtp_user, &self.smtp_pass) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        Some(EmailSettings {
            host,
            port: self.smtp_port,
            from: self.smtp_user.clone().unwrap_or_else(|| to.clone()),
            to,
            credentials,
        })
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }

    pub fn alert_timeout(&self) -> Duration {
        Duration::from_millis(self.alert_timeout_ms)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    /// Where identity names come from.
    pub fn label_source(&self) -> Box<dyn DirectorySource> {
        match &self.dataset_dir {
            Some(dir) => labels::source_for_path(dir),
            None => labels::source_for_path(&self.labels_path),
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
}

/// Overwrite `target` with the parsed value of `key`; unparseable values are
/// ignored with a warning.
fn env_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment value"),
    }
}
