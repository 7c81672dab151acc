use std::env;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

pub const ANALYZER_URL_ENV: &str = "EMOTION_BACKEND_URL";
pub const FRAME_INTERVAL_ENV: &str = "EMOTION_FRAME_INTERVAL_MS";
pub const SETTLE_DELAY_ENV: &str = "EMOTION_SETTLE_DELAY_MS";
pub const REQUEST_TIMEOUT_ENV: &str = "EMOTION_REQUEST_TIMEOUT_MS";
pub const CAMERA_ENV: &str = "EMOTION_CAMERA";
pub const CAMERA_INDEX_ENV: &str = "EMOTION_CAMERA_INDEX";

pub const DEFAULT_ANALYZER_URL: &str = "http://127.0.0.1:5000";
const DEFAULT_FRAME_INTERVAL_MS: u64 = 1000;
const DEFAULT_SETTLE_DELAY_MS: u64 = 500; // lets the first real frames render
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const CONFIG_FILE_NAME: &str = "moodcam.json";

/// Errors raised while resolving startup configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    InvalidUrl { value: String, reason: String },
    InvalidValue { key: &'static str, value: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config {}: {source}", path.display())
            }
            ConfigError::InvalidUrl { value, reason } => {
                write!(f, "Invalid analyzer URL `{value}`: {reason}")
            }
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "Invalid value `{value}` for {key}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Which capture device backs the camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    Webcam,
    Synthetic,
}

impl CameraKind {
    /// Native capture when it was compiled in, otherwise the test pattern.
    pub fn default_for_build() -> Self {
        if cfg!(feature = "webcam") {
            CameraKind::Webcam
        } else {
            CameraKind::Synthetic
        }
    }
}

impl FromStr for CameraKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "webcam" => Ok(CameraKind::Webcam),
            "synthetic" => Ok(CameraKind::Synthetic),
            other => Err(format!("expected `webcam` or `synthetic`, got `{other}`")),
        }
    }
}

impl fmt::Display for CameraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraKind::Webcam => write!(f, "webcam"),
            CameraKind::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// On-disk overrides read from `~/.config/moodcam.json`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub analyzer_url: Option<String>,
    #[serde(default)]
    pub frame_interval_ms: Option<u64>,
    #[serde(default)]
    pub settle_delay_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub camera: Option<CameraKind>,
    #[serde(default)]
    pub camera_index: Option<u32>,
}

/// Fully resolved runtime configuration, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub analyzer_url: String,
    pub frame_interval: Duration,
    pub settle_delay: Duration,
    pub request_timeout: Duration,
    pub camera: CameraKind,
    pub camera_index: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            analyzer_url: DEFAULT_ANALYZER_URL.to_string(),
            frame_interval: Duration::from_millis(DEFAULT_FRAME_INTERVAL_MS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            camera: CameraKind::default_for_build(),
            camera_index: 0,
        }
    }
}

impl AppConfig {
    /// Resolve configuration: config file → environment → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match config_path() {
            Some(path) => read_config_file(&path)?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| env::var(key).ok())
    }

    pub fn resolve<E>(file: FileConfig, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());
        let defaults = AppConfig::default();

        let analyzer_url = match file.analyzer_url.filter(|url| !url.trim().is_empty()) {
            Some(url) => validate_url(&url)?,
            None => match env(ANALYZER_URL_ENV) {
                Some(url) => validate_url(&url)?,
                None => defaults.analyzer_url,
            },
        };

        let frame_interval = match file.frame_interval_ms {
            Some(ms) => positive_millis("frame_interval_ms", ms)?,
            None => match env(FRAME_INTERVAL_ENV) {
                Some(raw) => positive_millis(FRAME_INTERVAL_ENV, parse_u64(FRAME_INTERVAL_ENV, &raw)?)?,
                None => defaults.frame_interval,
            },
        };

        let settle_delay = match file.settle_delay_ms {
            Some(ms) => Duration::from_millis(ms),
            None => match env(SETTLE_DELAY_ENV) {
                Some(raw) => Duration::from_millis(parse_u64(SETTLE_DELAY_ENV, &raw)?),
                None => defaults.settle_delay,
            },
        };

        let request_timeout = match file.request_timeout_ms {
            Some(ms) => positive_millis("request_timeout_ms", ms)?,
            None => match env(REQUEST_TIMEOUT_ENV) {
                Some(raw) => {
                    positive_millis(REQUEST_TIMEOUT_ENV, parse_u64(REQUEST_TIMEOUT_ENV, &raw)?)?
                }
                None => defaults.request_timeout,
            },
        };

        let camera = match file.camera {
            Some(kind) => kind,
            None => match env(CAMERA_ENV) {
                Some(raw) => raw.parse::<CameraKind>().map_err(|reason| ConfigError::InvalidValue {
                    key: CAMERA_ENV,
                    value: raw.clone(),
                    reason,
                })?,
                None => defaults.camera,
            },
        };

        let camera_index = match file.camera_index {
            Some(index) => index,
            None => match env(CAMERA_INDEX_ENV) {
                Some(raw) => raw.trim().parse::<u32>().map_err(|err| {
                    ConfigError::InvalidValue {
                        key: CAMERA_INDEX_ENV,
                        value: raw.clone(),
                        reason: err.to_string(),
                    }
                })?,
                None => defaults.camera_index,
            },
        };

        Ok(Self {
            analyzer_url,
            frame_interval,
            settle_delay,
            request_timeout,
            camera,
            camera_index,
        })
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join(CONFIG_FILE_NAME))
}

/// A missing file is not an error; a malformed one is.
pub fn read_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn validate_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let parsed = Url::parse(trimmed).map_err(|err| ConfigError::InvalidUrl {
        value: trimmed.to_string(),
        reason: err.to_string(),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            value: trimmed.to_string(),
            reason: format!("unsupported scheme `{}`", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            value: trimmed.to_string(),
            reason: "missing host".into(),
        });
    }

    Ok(trimmed.trim_end_matches('/').to_string())
}

fn parse_u64(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: err.to_string(),
        })
}

fn positive_millis(key: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: ms.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_millis(ms))
}
