//! Feature vectors and the per-session feature buffer.
//!
//! A feature vector is one fixed-arity numeric snapshot of the printer taken
//! by the sampler. Layout, in order:
//!
//! | index        | feature                                   |
//! |--------------|-------------------------------------------|
//! | 0            | printer state code                        |
//! | 1            | SD card ready flag                        |
//! | 2            | last run of the same job succeeded        |
//! | 3            | elapsed print time                        |
//! | 4            | current Z height                          |
//! | 5, 6, 7      | lankiness XY, YZ, XZ                      |
//! | 8            | resend ratio                              |
//! | 9            | recent filament change                    |
//! | 10           | recent tool change                        |
//! | 11           | feedrate                                  |
//! | 12           | feedrate percent                          |
//! | 13..16       | bed actual, target, offset                |
//! | 16..19       | chamber actual, target, offset            |
//! | 19 + 3n ..   | tool n actual, target, offset             |

use log::debug;
use serde::Serialize;

use crate::error::VectorError;
use crate::telemetry::{JobDimensions, PrinterSnapshot, TemperatureReading};

/// Number of features that do not depend on the extruder count.
pub const BASE_FEATURE_COUNT: usize = 19;

/// Features contributed by each extruder.
pub const FEATURES_PER_TOOL: usize = 3;

/// Vector arity for a printer with `extruders` tools.
pub fn feature_arity(extruders: usize) -> usize {
    BASE_FEATURE_COUNT + FEATURES_PER_TOOL * extruders
}

/// Printer connection/job state, encoded by its numeric code in the vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum PrinterState {
    OpenSerial,
    DetectSerial,
    DetectBaudrate,
    Connecting,
    Operational,
    Printing,
    Paused,
    Closed,
    Error,
    ClosedWithError,
    TransferringFile,
    Offline,
    #[default]
    Unknown,
    None,
}

impl PrinterState {
    pub fn code(self) -> u8 {
        match self {
            PrinterState::OpenSerial => 0,
            PrinterState::DetectSerial => 1,
            PrinterState::DetectBaudrate => 2,
            PrinterState::Connecting => 3,
            PrinterState::Operational => 4,
            PrinterState::Printing => 5,
            PrinterState::Paused => 6,
            PrinterState::Closed => 7,
            PrinterState::Error => 8,
            PrinterState::ClosedWithError => 9,
            PrinterState::TransferringFile => 10,
            PrinterState::Offline => 11,
            PrinterState::Unknown => 12,
            PrinterState::None => 13,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let state = match code {
            0 => PrinterState::OpenSerial,
            1 => PrinterState::DetectSerial,
            2 => PrinterState::DetectBaudrate,
            3 => PrinterState::Connecting,
            4 => PrinterState::Operational,
            5 => PrinterState::Printing,
            6 => PrinterState::Paused,
            7 => PrinterState::Closed,
            8 => PrinterState::Error,
            9 => PrinterState::ClosedWithError,
            10 => PrinterState::TransferringFile,
            11 => PrinterState::Offline,
            12 => PrinterState::Unknown,
            13 => PrinterState::None,
            _ => return None,
        };
        Some(state)
    }
}

/// One sampling cycle's features.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check arity and finiteness against a session's fixed arity.
    pub fn validate(&self, arity: usize) -> Result<(), VectorError> {
        if self.0.len() != arity {
            return Err(VectorError::ArityMismatch {
                expected: arity,
                actual: self.0.len(),
            });
        }
        match self.0.iter().position(|v| !v.is_finite()) {
            Some(index) => Err(VectorError::NonFinite {
                index,
                value: self.0[index],
            }),
            None => Ok(()),
        }
    }
}

impl From<Vec<f64>> for FeatureVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// Append-only store of the current session's feature vectors.
///
/// The buffer is bounded by the session, not by capacity. It is replaced
/// wholesale when a new print starts.
#[derive(Debug, Clone)]
pub struct FeatureBuffer {
    arity: usize,
    rows: Vec<FeatureVector>,
}

impl FeatureBuffer {
    pub fn new(arity: usize) -> Self {
        Self {
            arity,
            rows: Vec::new(),
        }
    }

    /// Append a vector.
    ///
    /// # Errors
    ///
    /// Returns [`VectorError`] if the vector's length differs from the
    /// buffer's arity or any element is not finite. The buffer is unchanged
    /// in that case.
    pub fn append(&mut self, vector: FeatureVector) -> Result<(), VectorError> {
        vector.validate(self.arity)?;
        self.rows.push(vector);
        Ok(())
    }

    /// The newest `n` vectors in session order, or all of them if fewer.
    pub fn latest(&self, n: usize) -> &[FeatureVector] {
        let start = self.rows.len().saturating_sub(n);
        &self.rows[start..]
    }

    pub fn all(&self) -> &[FeatureVector] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

/// Motion and change-tracking inputs maintained outside the telemetry source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionContext {
    pub feedrate: f64,
    pub feedrate_percent: f64,
    pub recent_filament_change: bool,
    pub recent_tool_change: bool,
}

impl Default for MotionContext {
    fn default() -> Self {
        Self {
            feedrate: 1.0,
            feedrate_percent: 1.0,
            recent_filament_change: false,
            recent_tool_change: false,
        }
    }
}

/// Job-level inputs looked up per cycle from the active file.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JobContext {
    pub dimensions: Option<JobDimensions>,
    pub last_success: bool,
}

/// Width/depth/height aspect ratios `[XY, YZ, XZ]` of the active job.
///
/// No job, or a zero dimension in a denominator, yields 0.0 for the
/// affected ratio.
pub fn lankiness(dimensions: Option<JobDimensions>) -> [f64; 3] {
    match dimensions {
        Some(d) => [
            checked_ratio(d.width, d.depth),
            checked_ratio(d.depth, d.height),
            checked_ratio(d.width, d.height),
        ],
        None => [0.0; 3],
    }
}

fn checked_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        debug!("Zero job dimension in lankiness ratio, substituting 0.0");
        return 0.0;
    }
    let ratio = numerator / denominator;
    if ratio.is_finite() { ratio } else { 0.0 }
}

fn push_reading(row: &mut Vec<f64>, reading: Option<TemperatureReading>) {
    let reading = reading.unwrap_or_default();
    row.push(finite_or_zero(reading.actual));
    row.push(finite_or_zero(reading.target));
    row.push(finite_or_zero(reading.offset));
}

fn finite_or_zero(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Assemble one feature vector.
///
/// Every missing or non-finite reading is replaced by 0.0 so that the result
/// always has `feature_arity(extruders)` finite elements.
pub fn assemble(
    snapshot: &PrinterSnapshot,
    job: JobContext,
    motion: MotionContext,
    extruders: usize,
) -> FeatureVector {
    let mut row = Vec::with_capacity(feature_arity(extruders));
    let [xy, yz, xz] = lankiness(job.dimensions);

    row.push(f64::from(snapshot.state.code()));
    row.push(if snapshot.sd_ready { 1.0 } else { 0.0 });
    row.push(if job.last_success { 1.0 } else { 0.0 });
    row.push(finite_or_zero(snapshot.print_time));
    row.push(finite_or_zero(snapshot.current_z));
    row.extend([xy, yz, xz]);
    row.push(finite_or_zero(snapshot.resend_ratio));
    row.push(if motion.recent_filament_change { 1.0 } else { 0.0 });
    row.push(if motion.recent_tool_change { 1.0 } else { 0.0 });
    row.push(finite_or_zero(Some(motion.feedrate)));
    row.push(finite_or_zero(Some(motion.feedrate_percent)));

    push_reading(&mut row, snapshot.temperatures.bed);
    push_reading(&mut row, snapshot.temperatures.chamber);
    for tool in 0..extruders {
        push_reading(&mut row, snapshot.temperatures.tool(tool));
    }

    FeatureVector(row)
}
