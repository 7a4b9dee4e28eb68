use anyhow::Result;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::{sync::Arc, thread, time::Duration};

use print_sentinel::alerts::{AlertService, LogSink, NotificationSink};
use print_sentinel::config::{Config, constants};
use print_sentinel::detector::{AnomalyDetector, Collaborators};
use print_sentinel::inference::InferenceClient;
use print_sentinel::lifecycle::PrintEvent;
use print_sentinel::printer::PrinterService;

/// Print Sentinel - online anomaly detection for 3D prints.
///
/// Polls Moonraker for print state changes, drives the detector's lifecycle
/// from them and tails the gcode store so feedrate, tool changes and filament
/// changes reach the feature vectors.
///
/// # Environment Variables
///
/// Required:
/// * `MOONRAKER_API_URL` - Moonraker API endpoint for telemetry and printer control
/// * `INFERENCE_URL` - Inference service root URL
///
/// Optional (with defaults):
/// * `DISCORD_WEBHOOK` - Discord webhook URL for alerts (log only when unset)
/// * `SETTINGS_FILE` - JSON settings file (built-in defaults when unset)
/// * `SAMPLE_PERIOD_MS` - Sampling period (default: 2000)
/// * `BATCH_SIZE` - Vectors per inference batch (default: 10)
/// * `WINDOW_SIZES` - Outlier window sizes (default: "10,100,1000")
/// * `COOLDOWN_SECONDS` - Cooldown after a corrective action (default: 300)
/// * `INFERENCE_TIMEOUT_MS` - Inference request timeout (default: 5000)
///
/// # Usage
///
/// ```bash
/// export MOONRAKER_API_URL="http://printer.local:7125"
/// export INFERENCE_URL="http://inference.local:8000"
/// export DISCORD_WEBHOOK="https://discord.com/api/webhooks/..."
/// ./print-sentinel
/// ```
///
/// The monitoring loop runs until the process is killed. No signal handler is
/// installed: SIGINT/SIGTERM end the process with the sampler and inference
/// threads, so no corrective action can be sent after termination. Embedders
/// that need a cooperative stop call [`AnomalyDetector::shutdown`].
fn main() -> Result<()> {
    // Initialize logger to output to stdout, using RUST_LOG env var or info level by default
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    // Load configuration from environment variables
    let config = Config::load().expect(
        "Failed to load configuration. Please ensure all required environment variables are set.",
    );
    let settings = config.initial_settings()?;

    info!("Print Sentinel starting...");
    info!("Using Moonraker API URL: {}", config.moonraker_api_url);
    info!("Using inference URL: {}", config.inference_url);
    info!(
        "Sampling every {:?}, batches of {}, windows {:?}",
        config.sample_period, config.batch_size, config.window_sizes
    );

    // Initialize services
    let printer_service = Arc::new(PrinterService::new(
        config.moonraker_api_url.clone(),
        config.inference_timeout,
    )?);
    let notifier: Arc<dyn NotificationSink> = match &config.discord_webhook {
        Some(webhook) => Arc::new(AlertService::new(webhook.clone())),
        None => {
            warn!("DISCORD_WEBHOOK not set, alerts will only be logged");
            Arc::new(LogSink)
        }
    };
    let inference = Arc::new(InferenceClient::new(
        config.inference_url.clone(),
        config.inference_timeout,
        settings.clone(),
    )?);

    let detector = AnomalyDetector::new(
        &config,
        settings,
        Collaborators {
            telemetry: printer_service.clone(),
            inference,
            printer: printer_service.clone(),
            notifier,
        },
    )?;

    info!("Print Sentinel initialized successfully. Starting monitoring loop...");

    let mut last_state = String::new();
    let mut gcode_cursor = chrono::Utc::now().timestamp() as f64;

    loop {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        debug!("{}: Starting new monitoring iteration", timestamp);

        let state = match printer_service.get_printer_status() {
            Ok(data) => print_state(&data),
            Err(e) => {
                warn!("Failed to get printer status: {}", e);
                thread::sleep(Duration::from_secs(constants::RETRY_DELAY_SECONDS));
                continue;
            }
        };

        if last_state != state {
            info!(
                "{}: Printer state changed from '{}' to '{}'",
                timestamp, last_state, state
            );
            if let Some(event) = transition_event(&last_state, &state) {
                detector.handle_event(event);
            }
            last_state = state;
        }

        if last_state == "printing" {
            match printer_service.recent_gcode(gcode_cursor) {
                Ok(lines) => {
                    for (time, line) in lines {
                        detector.observe_gcode(&line);
                        gcode_cursor = gcode_cursor.max(time);
                    }
                }
                Err(e) => error!("{}: Failed to read gcode store: {}", timestamp, e),
            }
        }

        // Small delay before next iteration
        thread::sleep(Duration::from_secs(constants::POLL_DELAY_SECONDS));
    }
}

fn print_state(data: &Value) -> String {
    data["result"]["status"]["print_stats"]["state"]
        .as_str()
        .unwrap_or("unknown")
        .to_string()
}

/// Map a Moonraker `print_stats.state` transition to a lifecycle event.
fn transition_event(previous: &str, current: &str) -> Option<PrintEvent> {
    match (previous, current) {
        ("paused", "printing") => Some(PrintEvent::Resumed),
        (_, "printing") => Some(PrintEvent::Started),
        (_, "paused") => Some(PrintEvent::Paused),
        (_, "complete") => Some(PrintEvent::Done),
        (_, "cancelled") => Some(PrintEvent::Cancelled),
        (_, "error") => Some(PrintEvent::Failed),
        _ => None,
    }
}
