use std::{fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// User-facing detector settings.
///
/// These are the options a settings UI exposes and saves. Thresholds and
/// confidence are percentages in `0..=100`. Any field missing from a saved
/// payload falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Snapshot URL of the printer camera, forwarded to the inference service.
    pub stream_url: String,

    /// Master switch. When off the sampler still collects features but the
    /// policy never notifies or acts.
    pub enable_detector: bool,

    /// Ask the inference service to email on notifications.
    pub enable_email_notification: bool,

    /// Address used when email notification is enabled.
    pub email_addr: String,

    /// Turn heaters off when a triggered print pauses or ends.
    pub enable_shutoff: bool,

    /// Stop (cancel) instead of pausing when the action threshold is hit.
    pub enable_stop: bool,

    /// Disable the extruder motor when a triggered print pauses or ends.
    pub enable_extruder_shutoff: bool,

    /// Outlier percentage that raises a UI warning.
    pub notification_threshold: f64,

    /// Outlier percentage that fires the corrective action set.
    pub action_threshold: f64,

    /// Minimum verdict confidence (percent) for a warning.
    pub confidence: f64,

    /// Length of the inference service's own smoothing buffer.
    pub buffer_length: u32,

    /// Percentage of that buffer that must agree on the service side.
    pub buffer_percent: f64,

    /// Allow the service to keep images attached to feedback reports.
    pub enable_feedback_images: bool,

    /// Key for the inference service.
    pub api_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stream_url: "http://127.0.0.1/webcam/?action=snapshot".to_string(),
            enable_detector: true,
            enable_email_notification: false,
            email_addr: String::new(),
            enable_shutoff: false,
            enable_stop: false,
            enable_extruder_shutoff: false,
            notification_threshold: 40.0,
            action_threshold: 60.0,
            confidence: 60.0,
            buffer_length: 16,
            buffer_percent: 80.0,
            enable_feedback_images: true,
            api_key: String::new(),
        }
    }
}

impl Settings {
    /// Parse a (possibly partial) JSON settings payload.
    pub fn from_json(payload: &str) -> Result<Self, ConfigError> {
        let settings: Settings =
            serde_json::from_str(payload).map_err(|e| ConfigError::InvalidValue {
                field: "settings".to_string(),
                value: payload.chars().take(64).collect(),
                reason: e.to_string(),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file.
    pub fn load_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let payload = fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&payload)
    }

    /// Reject percentages outside `0..=100`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("notification_threshold", self.notification_threshold),
            ("action_threshold", self.action_threshold),
            ("confidence", self.confidence),
            ("buffer_percent", self.buffer_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "must be a percentage between 0 and 100".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether switching from `self` to `other` changes the threshold policy.
    pub fn policy_changed(&self, other: &Settings) -> bool {
        self.notification_threshold != other.notification_threshold
            || self.action_threshold != other.action_threshold
            || self.confidence != other.confidence
    }
}

/// Daemon configuration loaded from environment variables.
///
/// Holds everything that is fixed for the lifetime of a detector instance:
/// collaborator endpoints, sampling cadence and window geometry.
#[derive(Debug, Clone)]
pub struct Config {
    /// Moonraker API URL used for telemetry and printer control.
    /// Environment variable: `MOONRAKER_API_URL`
    pub moonraker_api_url: String,

    /// Endpoint of the remote inference service.
    /// Environment variable: `INFERENCE_URL`
    pub inference_url: String,

    /// Discord webhook URL for alerts. Alerts are only logged when unset.
    /// Environment variable: `DISCORD_WEBHOOK`
    pub discord_webhook: Option<String>,

    /// Optional JSON file holding [`Settings`].
    /// Environment variable: `SETTINGS_FILE`
    pub settings_file: Option<PathBuf>,

    /// Sampler period.
    /// Environment variable: `SAMPLE_PERIOD_MS`
    pub sample_period: Duration,

    /// Number of cycles per inference batch.
    /// Environment variable: `BATCH_SIZE`
    pub batch_size: usize,

    /// Trailing window sizes, in verdicts.
    /// Environment variable: `WINDOW_SIZES` (comma-separated)
    pub window_sizes: Vec<usize>,

    /// Suppression interval after a corrective action.
    /// Environment variable: `COOLDOWN_SECONDS`
    pub cooldown: Duration,

    /// Upper bound on a single inference request.
    /// Environment variable: `INFERENCE_TIMEOUT_MS`
    pub inference_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            moonraker_api_url: String::new(),
            inference_url: String::new(),
            discord_webhook: None,
            settings_file: None,
            sample_period: Duration::from_millis(constants::DEFAULT_SAMPLE_PERIOD_MS),
            batch_size: constants::DEFAULT_BATCH_SIZE,
            window_sizes: constants::DEFAULT_WINDOW_SIZES.to_vec(),
            cooldown: Duration::from_secs(constants::DEFAULT_COOLDOWN_SECONDS),
            inference_timeout: Duration::from_millis(constants::DEFAULT_INFERENCE_TIMEOUT_MS),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value cannot
    /// be parsed:
    /// - `MOONRAKER_API_URL`: Moonraker API URL (required)
    /// - `INFERENCE_URL`: inference service URL (required)
    /// - `DISCORD_WEBHOOK`: Discord webhook URL (optional)
    /// - `SETTINGS_FILE`: settings JSON path (optional)
    /// - `SAMPLE_PERIOD_MS`: sampler period (default: "2000")
    /// - `BATCH_SIZE`: cycles per batch (default: "10")
    /// - `WINDOW_SIZES`: outlier windows (default: "10,100,1000")
    /// - `COOLDOWN_SECONDS`: action cooldown (default: "300")
    /// - `INFERENCE_TIMEOUT_MS`: inference request timeout (default: "5000")
    pub fn load() -> Result<Self, ConfigError> {
        let moonraker_api_url = required_var("MOONRAKER_API_URL")?;
        let inference_url = required_var("INFERENCE_URL")?;
        let discord_webhook = std::env::var("DISCORD_WEBHOOK")
            .ok()
            .filter(|url| !url.is_empty());
        let settings_file = std::env::var("SETTINGS_FILE").ok().map(PathBuf::from);

        let sample_period = Duration::from_millis(parse_var(
            "SAMPLE_PERIOD_MS",
            constants::DEFAULT_SAMPLE_PERIOD_MS,
        )?);
        let batch_size = parse_var("BATCH_SIZE", constants::DEFAULT_BATCH_SIZE)?;
        let window_sizes = match std::env::var("WINDOW_SIZES") {
            Ok(raw) => parse_window_sizes(&raw)?,
            Err(_) => constants::DEFAULT_WINDOW_SIZES.to_vec(),
        };
        let cooldown = Duration::from_secs(parse_var(
            "COOLDOWN_SECONDS",
            constants::DEFAULT_COOLDOWN_SECONDS,
        )?);
        let inference_timeout = Duration::from_millis(parse_var(
            "INFERENCE_TIMEOUT_MS",
            constants::DEFAULT_INFERENCE_TIMEOUT_MS,
        )?);

        let config = Config {
            moonraker_api_url,
            inference_url,
            discord_webhook,
            settings_file,
            sample_period,
            batch_size,
            window_sizes,
            cooldown,
            inference_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the values that would make the detector unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_window_sizes(&self.window_sizes)?;
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "BATCH_SIZE".to_string(),
                value: "0".to_string(),
                reason: "batch size must be at least 1".to_string(),
            });
        }
        if self.sample_period.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "SAMPLE_PERIOD_MS".to_string(),
                value: "0".to_string(),
                reason: "sample period must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Settings from `SETTINGS_FILE`, or the defaults.
    pub fn initial_settings(&self) -> Result<Settings, ConfigError> {
        match &self.settings_file {
            Some(path) if path.exists() => Settings::load_file(path),
            _ => Ok(Settings::default()),
        }
    }
}

/// Parse a comma-separated list of window sizes.
pub fn parse_window_sizes(raw: &str) -> Result<Vec<usize>, ConfigError> {
    let sizes = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>().map_err(|e| ConfigError::InvalidWindows {
                reason: format!("'{}' is not a window size: {}", s, e),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    validate_window_sizes(&sizes)?;
    Ok(sizes)
}

/// Window sizes must be non-empty, non-zero and distinct.
pub fn validate_window_sizes(sizes: &[usize]) -> Result<(), ConfigError> {
    if sizes.is_empty() {
        return Err(ConfigError::InvalidWindows {
            reason: "at least one window is required".to_string(),
        });
    }
    if sizes.contains(&0) {
        return Err(ConfigError::InvalidWindows {
            reason: "window sizes must be positive".to_string(),
        });
    }
    let mut sorted = sizes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != sizes.len() {
        return Err(ConfigError::InvalidWindows {
            reason: "window sizes must be distinct".to_string(),
        });
    }
    Ok(())
}

fn required_var(var_name: &str) -> Result<String, ConfigError> {
    std::env::var(var_name).map_err(|_| ConfigError::MissingEnvVar {
        var_name: var_name.to_string(),
    })
}

fn parse_var<T>(var_name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var_name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            field: var_name.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Application constants used throughout the system.
pub mod constants {
    /// Default sampler period in milliseconds.
    pub const DEFAULT_SAMPLE_PERIOD_MS: u64 = 2000;

    /// Default number of cycles per inference batch.
    pub const DEFAULT_BATCH_SIZE: usize = 10;

    /// Default trailing windows (short, medium, long).
    pub const DEFAULT_WINDOW_SIZES: [usize; 3] = [10, 100, 1000];

    /// Default cooldown after a corrective action, in seconds.
    pub const DEFAULT_COOLDOWN_SECONDS: u64 = 300;

    /// Default inference request timeout in milliseconds.
    pub const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 5000;

    /// A tool or filament change counts as recent for this many seconds.
    pub const RECENT_CHANGE_SECONDS: u64 = 300;

    /// Consecutive inference failures before the sampler degrades.
    pub const MAX_INFERENCE_FAILURES: u32 = 3;

    /// While degraded, only every n-th batch is sent as a recovery probe.
    pub const DEGRADED_PROBE_INTERVAL: u64 = 5;

    /// Heartbeat period while a print is paused, in seconds.
    pub const HEARTBEAT_SECONDS: u64 = 30;

    /// Delay between iterations of the daemon's polling loop, in seconds.
    pub const POLL_DELAY_SECONDS: u64 = 1;

    /// Delay before retrying after the printer could not be reached, in seconds.
    pub const RETRY_DELAY_SECONDS: u64 = 15;

    /// Capacity of the score moving-average buffer.
    pub const SCORE_AVERAGE_CAPACITY: usize = 100;
}
