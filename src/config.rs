//! Engine configuration loading, including timer intervals and the live window.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use time::{OffsetDateTime, Time, format_description::BorrowedFormatItem, macros::format_description};
use tracing::{info, warn};

/// Default location on disk where the engine looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/draw-sync.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "DRAW_SYNC_CONFIG_PATH";
/// Format accepted for live window boundaries in the configuration file.
const TIME_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]");

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the engine.
pub struct SyncConfig {
    /// Maximum consecutive failed connection attempts before giving up.
    pub max_connect_attempts: u32,
    /// Delay between failed connection attempts.
    pub reconnect_delay: Duration,
    /// Interval between heartbeat pings while connected.
    pub heartbeat_interval: Duration,
    /// Interval of the shared reveal animation tick.
    pub tick_interval: Duration,
    /// How long a freshly revealed field keeps its highlight before settling.
    pub settle_delay: Duration,
    /// Directory holding the per-topic snapshot cache files.
    pub snapshot_dir: PathBuf,
    /// Time-of-day range during which push updates are expected.
    ///
    /// Outside this window (and only there) the engine may issue the one-shot
    /// fallback pull. `None` disables the fallback entirely.
    pub live_window: Option<LiveWindow>,
}

impl SyncConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(path = %path.display(), "loaded engine configuration");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            tick_interval: Duration::from_millis(300),
            settle_delay: Duration::from_millis(800),
            snapshot_dir: PathBuf::from("cache"),
            live_window: Some(LiveWindow {
                start: time::macros::time!(18:00),
                end: time::macros::time!(19:00),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Time-of-day range during which push updates are expected.
pub struct LiveWindow {
    /// Inclusive start of the window.
    pub start: Time,
    /// Inclusive end of the window.
    pub end: Time,
}

impl LiveWindow {
    /// Whether the given instant's time of day falls inside the window.
    ///
    /// A window whose end precedes its start wraps across midnight.
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        let t = at.time();
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    max_connect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    tick_interval_ms: Option<u64>,
    settle_delay_ms: Option<u64>,
    snapshot_dir: Option<PathBuf>,
    live_window: Option<RawWindow>,
}

#[derive(Debug, Deserialize)]
/// JSON representation of the live window, boundaries formatted as `HH:MM`.
struct RawWindow {
    start: String,
    end: String,
}

impl From<RawConfig> for SyncConfig {
    fn from(raw: RawConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_connect_attempts: raw
                .max_connect_attempts
                .unwrap_or(defaults.max_connect_attempts),
            reconnect_delay: raw
                .reconnect_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_delay),
            heartbeat_interval: raw
                .heartbeat_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            tick_interval: raw
                .tick_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            settle_delay: raw
                .settle_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.settle_delay),
            snapshot_dir: raw.snapshot_dir.unwrap_or(defaults.snapshot_dir),
            live_window: match raw.live_window {
                Some(window) => parse_window(&window).or(defaults.live_window),
                None => defaults.live_window,
            },
        }
    }
}

/// Parse a raw window, rejecting it (with a warning) when a boundary is malformed.
fn parse_window(raw: &RawWindow) -> Option<LiveWindow> {
    let start = Time::parse(&raw.start, TIME_FORMAT);
    let end = Time::parse(&raw.end, TIME_FORMAT);
    match (start, end) {
        (Ok(start), Ok(end)) => Some(LiveWindow { start, end }),
        _ => {
            warn!(
                start = %raw.start,
                end = %raw.end,
                "invalid live window boundaries; keeping default window"
            );
            None
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
