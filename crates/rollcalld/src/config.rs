use crate::dispatcher::{DispatchMode, Endpoint};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an optional TOML config file.
const CONFIG_FILE_VAR: &str = "ROLLCALL_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// One HTTP GET per poll period.
    Snapshot,
    /// Continuous MJPEG stream, throttled by the frame sampler.
    Stream,
}

impl FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "snapshot" => Ok(CaptureMode::Snapshot),
            "stream" => Ok(CaptureMode::Stream),
            other => Err(format!("unknown capture mode {other:?}")),
        }
    }
}

/// Which D-Bus bus to publish the control interface on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
    Off,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            "off" | "none" | "0" => Ok(BusKind::Off),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditBackend {
    Csv,
    Sqlite,
}

/// Daemon configuration, loaded from `ROLLCALL_*` environment variables or
/// from the TOML file named by `ROLLCALL_CONFIG`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base URL of the roster/attendance service.
    pub api_base: String,
    /// Sent as `X-API-Key` on attendance submissions when set.
    pub api_key: Option<String>,
    pub known_faces_endpoint: String,
    pub attendance_endpoint: String,
    /// When set, every Sent outcome is also posted here (dual-submit).
    pub consolidate_endpoint: Option<String>,
    /// Face detection + feature extraction service.
    pub encoder_url: String,
    pub capture_mode: CaptureMode,
    pub snapshot_url: String,
    pub stream_url: String,
    /// Seconds between snapshot requests.
    pub poll_seconds: f64,
    /// Frames per second handed to the encoder in stream mode.
    pub sampler_fps: f64,
    /// Maximum Euclidean distance accepted as a match (smaller = stricter).
    pub match_tolerance: f64,
    /// Minimum seconds between two events for the same identity.
    pub dedup_seconds: i64,
    pub device_label: Option<String>,
    pub classroom_code: Option<String>,
    /// Audit log location; `.db`/`.sqlite`/`.sqlite3` selects SQLite, anything else CSV.
    pub audit_path: PathBuf,
    /// Timeout for roster, encoder, and dispatch requests.
    pub request_timeout_secs: u64,
    /// Timeout for a snapshot fetch or a stream read.
    pub frame_timeout_secs: u64,
    /// Delay before retrying after a failed frame acquisition.
    pub retry_backoff_secs: f64,
    /// Periodic roster rebuild; 0 disables.
    pub roster_refresh_secs: u64,
    pub dbus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:3001".to_string(),
            api_key: None,
            known_faces_endpoint: "/api/known-faces".to_string(),
            attendance_endpoint: "/api/attendance".to_string(),
            consolidate_endpoint: None,
            encoder_url: "http://localhost:5005/encode".to_string(),
            capture_mode: CaptureMode::Snapshot,
            snapshot_url: "http://localhost:4000/api/cam/capture".to_string(),
            stream_url: "http://localhost:8080/stream".to_string(),
            poll_seconds: 1.0,
            sampler_fps: 2.0,
            match_tolerance: 0.5,
            dedup_seconds: 60,
            device_label: Some("esp32-cam-01".to_string()),
            classroom_code: None,
            audit_path: PathBuf::from("reco_log.csv"),
            request_timeout_secs: 15,
            frame_timeout_secs: 20,
            retry_backoff_secs: 2.0,
            roster_refresh_secs: 0,
            dbus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` if set, otherwise from the environment,
    /// then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match std::env::var(CONFIG_FILE_VAR) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            api_base: env_string(lookup, "ROLLCALL_API_BASE", d.api_base),
            api_key: env_optional(lookup, "ROLLCALL_API_KEY", d.api_key),
            known_faces_endpoint: env_string(
                lookup,
                "ROLLCALL_KNOWN_FACES_ENDPOINT",
                d.known_faces_endpoint,
            ),
            attendance_endpoint: env_string(
                lookup,
                "ROLLCALL_ATTENDANCE_ENDPOINT",
                d.attendance_endpoint,
            ),
            consolidate_endpoint: env_optional(
                lookup,
                "ROLLCALL_CONSOLIDATE_ENDPOINT",
                d.consolidate_endpoint,
            ),
            encoder_url: env_string(lookup, "ROLLCALL_ENCODER_URL", d.encoder_url),
            capture_mode: env_parse(lookup, "ROLLCALL_CAPTURE_MODE", d.capture_mode)?,
            snapshot_url: env_string(lookup, "ROLLCALL_SNAPSHOT_URL", d.snapshot_url),
            stream_url: env_string(lookup, "ROLLCALL_STREAM_URL", d.stream_url),
            poll_seconds: env_parse(lookup, "ROLLCALL_POLL_SECONDS", d.poll_seconds)?,
            sampler_fps: env_parse(lookup, "ROLLCALL_SAMPLER_FPS", d.sampler_fps)?,
            match_tolerance: env_parse(lookup, "ROLLCALL_MATCH_TOLERANCE", d.match_tolerance)?,
            dedup_seconds: env_parse(lookup, "ROLLCALL_DEDUP_SECONDS", d.dedup_seconds)?,
            device_label: env_optional(lookup, "ROLLCALL_DEVICE_LABEL", d.device_label),
            classroom_code: env_optional(lookup, "ROLLCALL_CLASSROOM_CODE", d.classroom_code),
            audit_path: lookup("ROLLCALL_AUDIT_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.audit_path),
            request_timeout_secs: env_parse(
                lookup,
                "ROLLCALL_REQUEST_TIMEOUT_SECS",
                d.request_timeout_secs,
            )?,
            frame_timeout_secs: env_parse(
                lookup,
                "ROLLCALL_FRAME_TIMEOUT_SECS",
                d.frame_timeout_secs,
            )?,
            retry_backoff_secs: env_parse(
                lookup,
                "ROLLCALL_RETRY_BACKOFF_SECS",
                d.retry_backoff_secs,
            )?,
            roster_refresh_secs: env_parse(
                lookup,
                "ROLLCALL_ROSTER_REFRESH_SECS",
                d.roster_refresh_secs,
            )?,
            dbus: env_parse(lookup, "ROLLCALL_DBUS", d.dbus)?,
        })
    }

    /// Reject values that would make matching or scheduling meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_tolerance.is_finite() || self.match_tolerance < 0.0 {
            return Err(invalid(format!(
                "match_tolerance must be a non-negative number, got {}",
                self.match_tolerance
            )));
        }
        if self.dedup_seconds < 0 {
            return Err(invalid(format!(
                "dedup_seconds must be non-negative, got {}",
                self.dedup_seconds
            )));
        }
        for (name, value) in [
            ("poll_seconds", self.poll_seconds),
            ("sampler_fps", self.sampler_fps),
            ("retry_backoff_secs", self.retry_backoff_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(format!("{name} must be positive, got {value}")));
            }
        }
        if self.request_timeout_secs == 0 || self.frame_timeout_secs == 0 {
            return Err(invalid("timeouts must be at least one second".into()));
        }
        if self.api_base.trim().is_empty() {
            return Err(invalid("api_base must not be empty".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_secs_f64(self.poll_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.retry_backoff_secs)
    }

    pub fn dedup_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_seconds)
    }

    pub fn roster_refresh(&self) -> Option<Duration> {
        (self.roster_refresh_secs > 0).then(|| Duration::from_secs(self.roster_refresh_secs))
    }

    pub fn roster_url(&self) -> String {
        self.resolve(&self.known_faces_endpoint)
    }

    /// Single-submit unless a consolidation endpoint is configured.
    pub fn dispatch_mode(&self) -> DispatchMode {
        let attendance = Endpoint::authenticated(self.resolve(&self.attendance_endpoint));
        match &self.consolidate_endpoint {
            Some(consolidate) => DispatchMode::Dual {
                attendance,
                consolidation: Endpoint::open(self.resolve(consolidate)),
            },
            None => DispatchMode::Single { attendance },
        }
    }

    pub fn audit_backend(&self) -> AuditBackend {
        match self
            .audit_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("db" | "sqlite" | "sqlite3") => AuditBackend::Sqlite,
            _ => AuditBackend::Csv,
        }
    }

    /// Absolute URLs pass through; paths are appended to `api_base`.
    fn resolve(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        let base = self.api_base.trim_end_matches('/');
        if endpoint.starts_with('/') {
            format!("{base}{endpoint}")
        } else {
            format!("{base}/{endpoint}")
        }
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}

fn env_string(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: String) -> String {
    lookup(key).unwrap_or(default)
}

/// Unset keeps the default; set-but-empty clears it.
fn env_optional(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: Option<String>,
) -> Option<String> {
    match lookup(key) {
        Some(value) if value.trim().is_empty() => None,
        Some(value) => Some(value),
        None => default,
    }
}

fn env_parse<T: FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Parse { key, value }),
    }
}
