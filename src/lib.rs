//! Print Sentinel - online anomaly detection for 3D prints.
//!
//! Samples printer telemetry into fixed-layout feature vectors, sends batches
//! of them to an inference service, tracks how many recent verdicts were
//! outliers and pauses, stops or shuts off the printer when that density
//! crosses the configured thresholds.
//!
//! # Core Components
//!
//! * [`features`] - Feature vector layout and the per-print feature buffer
//! * [`sampler`] - Background sampling thread and inference worker
//! * [`outliers`] - Sliding-window outlier statistics
//! * [`policy`] - Notification/action thresholds with cooldown
//! * [`lifecycle`] - Print lifecycle events and gcode feedrate tracking
//! * [`detector`] - Ties the above together
//! * [`printer`] - Moonraker API integration for telemetry and printer control
//! * [`inference`] - Inference service client
//! * [`alerts`] - UI messages and Discord webhook alerts
//! * [`config`] - Environment configuration and user settings
//! * [`error`] - Error types
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use print_sentinel::*;
//!
//! let config = Config::load()?;
//! let settings = config.initial_settings()?;
//! let printer = Arc::new(PrinterService::new(
//!     config.moonraker_api_url.clone(),
//!     config.inference_timeout,
//! )?);
//! let inference = Arc::new(InferenceClient::new(
//!     config.inference_url.clone(),
//!     config.inference_timeout,
//!     settings.clone(),
//! )?);
//! let detector = AnomalyDetector::new(
//!     &config,
//!     settings,
//!     Collaborators {
//!         telemetry: printer.clone(),
//!         inference,
//!         printer,
//!         notifier: Arc::new(alerts::LogSink),
//!     },
//! )?;
//! detector.handle_event(PrintEvent::Started);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod alerts;
pub mod config;
pub mod detector;
pub mod error;
pub mod features;
pub mod inference;
pub mod lifecycle;
pub mod outliers;
pub mod policy;
pub mod printer;
pub mod sampler;
pub mod telemetry;

// Re-export commonly used types for convenience
pub use alerts::{AlertService, Notification, NotificationSink};
pub use config::{Config, Settings};
pub use detector::{AnomalyDetector, Collaborators, DetectorStatus};
pub use error::SentinelError;
pub use features::{FeatureBuffer, FeatureVector, PrinterState};
pub use inference::{InferenceClient, InferenceService, InferenceVerdict};
pub use lifecycle::{GcodeEffect, PrintEvent};
pub use outliers::OutlierWindowTracker;
pub use policy::{CorrectiveAction, Decision, PolicyState, ThresholdPolicy};
pub use printer::{PrinterControl, PrinterService};
pub use sampler::{Batch, SamplerMode};
pub use telemetry::TelemetrySource;
