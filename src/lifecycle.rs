use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;

use crate::config::constants;
use crate::features::{MotionContext, PrinterState};

/// Print lifecycle events delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrintEvent {
    Started,
    Paused,
    Resumed,
    Cancelled,
    Done,
    Failed,
    ToolChange,
    FilamentChange,
}

impl PrintEvent {
    /// Printer state implied by the event, if it changes one.
    pub fn implied_state(self) -> Option<PrinterState> {
        match self {
            PrintEvent::Started | PrintEvent::Resumed => Some(PrinterState::Printing),
            PrintEvent::Paused => Some(PrinterState::Paused),
            PrintEvent::Cancelled | PrintEvent::Done => Some(PrinterState::Operational),
            PrintEvent::Failed => Some(PrinterState::Error),
            PrintEvent::ToolChange | PrintEvent::FilamentChange => None,
        }
    }

    /// Whether the event ends the print session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PrintEvent::Cancelled | PrintEvent::Done | PrintEvent::Failed
        )
    }
}

/// What a gcode line changed, if anything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GcodeEffect {
    Feedrate(f64),
    FeedratePercent(f64),
    ToolChange,
    FilamentChange,
    Ignored,
}

/// Print state plus the motion inputs maintained from events and gcode.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    pub state: PrinterState,
    pub last_tool_change: Option<Instant>,
    pub last_filament_change: Option<Instant>,
    pub feedrate: f64,
    pub feedrate_percent: f64,
}

impl Default for LifecycleContext {
    fn default() -> Self {
        Self {
            state: PrinterState::Unknown,
            last_tool_change: None,
            last_filament_change: None,
            feedrate: 1.0,
            feedrate_percent: 1.0,
        }
    }
}

impl LifecycleContext {
    pub fn record_tool_change(&mut self, now: Instant) {
        self.last_tool_change = Some(now);
    }

    pub fn record_filament_change(&mut self, now: Instant) {
        self.last_filament_change = Some(now);
    }

    /// Motion inputs for a sampling cycle taken at `now`.
    pub fn motion(&self, now: Instant) -> MotionContext {
        MotionContext {
            feedrate: self.feedrate,
            feedrate_percent: self.feedrate_percent,
            recent_filament_change: is_recent(self.last_filament_change, now),
            recent_tool_change: is_recent(self.last_tool_change, now),
        }
    }

    /// Update feedrate, feedrate percent or change timestamps from a sent
    /// gcode line. Malformed parameters leave the previous values in place.
    pub fn observe_gcode(&mut self, line: &str, now: Instant) -> GcodeEffect {
        let effect = parse_gcode(line);
        match effect {
            GcodeEffect::Feedrate(value) => self.feedrate = value,
            GcodeEffect::FeedratePercent(value) => self.feedrate_percent = value,
            GcodeEffect::ToolChange => self.record_tool_change(now),
            GcodeEffect::FilamentChange => self.record_filament_change(now),
            GcodeEffect::Ignored => {}
        }
        effect
    }
}

fn is_recent(at: Option<Instant>, now: Instant) -> bool {
    at.is_some_and(|t| {
        now.saturating_duration_since(t) < Duration::from_secs(constants::RECENT_CHANGE_SECONDS)
    })
}

/// Classify one gcode line.
///
/// `G0`–`G3` moves carrying an `F` word set the feedrate, `M220 S<n>` sets the
/// feedrate percent, `T<n>` is a tool change and `M600` a filament change.
pub fn parse_gcode(line: &str) -> GcodeEffect {
    let code = line.split(';').next().unwrap_or_default();
    let mut words = code.split_whitespace();
    let mut command = words.next().unwrap_or_default().to_ascii_uppercase();
    // skip a leading line number
    if command.starts_with('N') && command[1..].chars().all(|c| c.is_ascii_digit()) {
        command = words.next().unwrap_or_default().to_ascii_uppercase();
    }

    match command.as_str() {
        "G0" | "G00" | "G1" | "G01" | "G2" | "G02" | "G3" | "G03" => {
            match word_value(words, 'F') {
                Some(value) => GcodeEffect::Feedrate(value),
                None => GcodeEffect::Ignored,
            }
        }
        "M220" => match word_value(words, 'S') {
            Some(value) => GcodeEffect::FeedratePercent(value),
            None => GcodeEffect::Ignored,
        },
        "M600" => GcodeEffect::FilamentChange,
        t if t.len() > 1 && t.starts_with('T') && t[1..].chars().all(|c| c.is_ascii_digit()) => {
            GcodeEffect::ToolChange
        }
        _ => GcodeEffect::Ignored,
    }
}

fn word_value<'a>(mut words: impl Iterator<Item = &'a str>, letter: char) -> Option<f64> {
    let word = words.find(|w| {
        w.chars()
            .next()
            .is_some_and(|c| c.eq_ignore_ascii_case(&letter))
    })?;
    match word[1..].parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value),
        _ => {
            debug!("Ignoring malformed gcode parameter '{}'", word);
            None
        }
    }
}
