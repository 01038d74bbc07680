use anyhow::{Context, Result};
use chrono::Duration;
use rollcall_core::{EventKind, PipelineConfig};
use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration.
///
/// Built from defaults, then the TOML file named by `ROLLCALL_CONFIG` (if
/// any), then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which a match is accepted.
    pub threshold: f32,
    /// Minimum interval between ledger events for one subject.
    pub throttle_window_ms: i64,
    /// Which field this session writes: arrival or departure.
    pub event_kind: EventKind,
    /// Gallery reload interval in seconds (0 disables reloading).
    pub gallery_refresh_secs: u64,
    /// Refuse to start when the gallery has no valid subject.
    pub require_subjects: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: rollcall_store::default_db_path(),
            threshold: 0.6,
            throttle_window_ms: 5000,
            event_kind: EventKind::Arrival,
            gallery_refresh_secs: 0,
            require_subjects: true,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self> {
        let base = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {path}"))?;
                Self::from_toml(&text).with_context(|| format!("invalid config file {path}"))?
            }
            Err(_) => Self::default(),
        };
        Ok(base.with_env(|key| std::env::var(key).ok()))
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overlay `ROLLCALL_*` variables. Unparseable values keep the prior setting.
    pub fn with_env(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            db_path: lookup("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(self.db_path),
            threshold: env_parse(&lookup, "ROLLCALL_THRESHOLD", self.threshold),
            throttle_window_ms: env_parse(
                &lookup,
                "ROLLCALL_THROTTLE_WINDOW_MS",
                self.throttle_window_ms,
            ),
            event_kind: env_parse(&lookup, "ROLLCALL_EVENT_KIND", self.event_kind),
            gallery_refresh_secs: env_parse(
                &lookup,
                "ROLLCALL_GALLERY_REFRESH_SECS",
                self.gallery_refresh_secs,
            ),
            require_subjects: lookup("ROLLCALL_REQUIRE_SUBJECTS")
                .map(|v| v != "0")
                .unwrap_or(self.require_subjects),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            threshold: self.threshold,
            throttle_window: Duration::milliseconds(self.throttle_window_ms),
            event_kind: self.event_kind,
            require_subjects: self.require_subjects,
        }
    }
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                default
            }
        },
        None => default,
    }
}
