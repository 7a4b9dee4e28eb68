//! Telemetry source boundary.
//!
//! The detector never talks to printer firmware directly. It reads a
//! [`PrinterSnapshot`] once per sampling cycle from whatever implements
//! [`TelemetrySource`]; fields the source cannot provide are `None` and are
//! replaced by defaults during feature assembly.

use anyhow::Result;

use crate::features::PrinterState;

/// One reading of a heater: actual, target and offset temperatures.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TemperatureReading {
    pub actual: Option<f64>,
    pub target: Option<f64>,
    pub offset: Option<f64>,
}

impl TemperatureReading {
    pub fn new(actual: f64, target: f64, offset: f64) -> Self {
        Self {
            actual: Some(actual),
            target: Some(target),
            offset: Some(offset),
        }
    }
}

/// All heater readings of one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Temperatures {
    pub bed: Option<TemperatureReading>,
    pub chamber: Option<TemperatureReading>,
    /// Indexed by tool number. Missing tools are `None`.
    pub tools: Vec<Option<TemperatureReading>>,
}

impl Temperatures {
    pub fn tool(&self, index: usize) -> Option<TemperatureReading> {
        self.tools.get(index).copied().flatten()
    }
}

/// Bounding box of the active job, in millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobDimensions {
    pub width: f64,
    pub depth: f64,
    pub height: f64,
}

/// Printer, job and temperature state at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrinterSnapshot {
    pub state: PrinterState,
    pub sd_ready: bool,
    /// File name of the active job, if any.
    pub job_file: Option<String>,
    /// Elapsed print time in seconds.
    pub print_time: Option<f64>,
    pub current_z: Option<f64>,
    /// Ratio of resent lines to sent lines.
    pub resend_ratio: Option<f64>,
    pub temperatures: Temperatures,
}

/// Source of printer telemetry.
pub trait TelemetrySource: Send + Sync {
    /// Current printer, job and temperature state.
    fn current_printer_state(&self) -> Result<PrinterSnapshot>;

    /// Bounding box of `filename`, if it is known.
    fn current_job_dimensions(&self, filename: &str) -> Result<Option<JobDimensions>>;

    /// Whether the previous run of `filename` finished successfully.
    fn job_history_last_success(&self, filename: &str) -> Result<bool>;

    /// Number of extruders on the active printer profile.
    fn extruder_count(&self) -> Result<usize>;
}
