use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;

use crate::features::PrinterState;
use crate::telemetry::{
    JobDimensions, PrinterSnapshot, TelemetrySource, TemperatureReading, Temperatures,
};

/// Corrective commands the detector can send to the printer.
///
/// Every command must be safe to repeat.
pub trait PrinterControl: Send + Sync {
    fn pause(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn shutoff_heaters(&self) -> Result<()>;
    fn shutoff_extruder(&self) -> Result<()>;
    /// Undo a previous shutoff and continue printing.
    fn restart(&self) -> Result<()>;
}

/// Heater targets saved before a shutoff so that a restart can restore them.
#[derive(Debug, Clone, Default, PartialEq)]
struct SavedTargets {
    bed: Option<f64>,
    tools: Vec<(String, f64)>,
}

impl SavedTargets {
    /// Whether any heater was set to a non-zero target.
    fn any_active(&self) -> bool {
        self.bed.is_some_and(|t| t > 0.0) || self.tools.iter().any(|(_, t)| *t > 0.0)
    }

    /// Gcode that puts the heaters back to these targets.
    fn restore_commands(&self) -> Vec<String> {
        let mut commands = Vec::new();
        if let Some(bed) = self.bed.filter(|t| *t > 0.0) {
            commands.push(format!("SET_HEATER_TEMPERATURE HEATER=heater_bed TARGET={}", bed));
        }
        for (tool, target) in self.tools.iter().filter(|(_, t)| *t > 0.0) {
            commands.push(format!("SET_HEATER_TEMPERATURE HEATER={} TARGET={}", tool, target));
        }
        commands
    }
}

/// Targets to keep after reading the current ones at shutoff time.
///
/// Live targets always replace what was saved earlier. Heaters that are
/// already off (a repeated shutoff) keep the earlier save.
fn targets_to_keep(previous: Option<SavedTargets>, current: SavedTargets) -> Option<SavedTargets> {
    if current.any_active() {
        Some(current)
    } else {
        previous.or(Some(current))
    }
}

/// Printer service for interacting with the Moonraker API.
///
/// Provides both printer control (pause, cancel, heater shutoff) and the
/// telemetry the sampler reads every cycle.
pub struct PrinterService {
    pub api_url: String,
    client: reqwest::blocking::Client,
    saved_targets: Mutex<Option<SavedTargets>>,
    extruders: Mutex<Option<usize>>,
}

impl PrinterService {
    /// Create a new PrinterService with the provided Moonraker API URL.
    ///
    /// # Arguments
    ///
    /// * `api_url` - Base URL for the Moonraker API (e.g., "http://printer.local:7125")
    /// * `timeout` - Upper bound for every request
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(api_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
            saved_targets: Mutex::new(None),
            extruders: Mutex::new(None),
        })
    }

    fn post(&self, path: &str, what: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}{}", self.api_url, path))
            .send()?;

        if !response.status().is_success() {
            return Err(anyhow!("Failed to {}: HTTP {}", what, response.status()));
        }

        Ok(())
    }

    fn get(&self, path: &str, query: &[(&str, &str)], what: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}{}", self.api_url, path))
            .query(query)
            .send()?;

        if !response.status().is_success() {
            return Err(anyhow!("Failed to {}: HTTP {}", what, response.status()));
        }

        Ok(response.json()?)
    }

    /// Query printer objects. Each entry is `name` or `name=attr1,attr2`.
    fn query_objects(&self, objects: &[String], what: &str) -> Result<Value> {
        let query = objects
            .iter()
            .map(|o| o.replace(' ', "%20"))
            .collect::<Vec<_>>()
            .join("&");
        let response = self
            .client
            .get(format!("{}/printer/objects/query?{}", self.api_url, query))
            .send()?;

        if !response.status().is_success() {
            return Err(anyhow!("Failed to {}: HTTP {}", what, response.status()));
        }

        Ok(response.json()?)
    }

    /// Run a gcode script through Klipper.
    pub fn run_gcode(&self, script: &str) -> Result<()> {
        debug!("Sending gcode script: {}", script);
        let response = self
            .client
            .post(format!("{}/printer/gcode/script", self.api_url))
            .query(&[("script", script)])
            .send()?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Failed to run gcode '{}': HTTP {}",
                script,
                response.status()
            ));
        }

        Ok(())
    }

    /// Pause the current print job.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP request fails or Moonraker returns an
    /// error status.
    pub fn pause_print(&self) -> Result<()> {
        self.post("/printer/print/pause", "pause print")
    }

    /// Resume the current print job.
    pub fn resume_print(&self) -> Result<()> {
        self.post("/printer/print/resume", "resume print")
    }

    /// Cancel the current print job.
    pub fn cancel_print(&self) -> Result<()> {
        self.post("/printer/print/cancel", "cancel print")
    }

    /// Get the current print state and webhook state.
    ///
    /// Returns the raw Moonraker `objects/query` JSON.
    pub fn get_printer_status(&self) -> Result<Value> {
        self.query_objects(
            &["webhooks".to_string(), "print_stats".to_string()],
            "get printer status",
        )
    }

    /// Gcode commands stored by Moonraker after `since` (Unix seconds).
    ///
    /// Returns `(time, line)` pairs in chronological order.
    pub fn recent_gcode(&self, since: f64) -> Result<Vec<(f64, String)>> {
        let data = self.get(
            "/server/gcode_store",
            &[("count", "100")],
            "read gcode store",
        )?;
        Ok(gcode_commands_since(&data, since))
    }

    fn heater_objects(&self) -> Result<Vec<String>> {
        let data = self.get("/printer/objects/list", &[], "list printer objects")?;
        Ok(object_names(&data))
    }

    fn save_targets(&self) -> Result<()> {
        let objects = self.heater_objects()?;
        let tools: Vec<String> = objects.into_iter().filter(|o| is_extruder(o)).collect();
        let mut query = vec!["heater_bed=target".to_string()];
        query.extend(tools.iter().map(|t| format!("{}=target", t)));
        let data = self.query_objects(&query, "read heater targets")?;
        let status = &data["result"]["status"];

        let saved = SavedTargets {
            bed: status["heater_bed"]["target"].as_f64(),
            tools: tools
                .iter()
                .filter_map(|t| status[t.as_str()]["target"].as_f64().map(|v| (t.clone(), v)))
                .collect(),
        };
        let mut slot = self.saved_targets.lock();
        *slot = targets_to_keep(slot.take(), saved);
        debug!("Heater targets saved for restart: {:?}", *slot);
        Ok(())
    }
}

impl PrinterService {
    /// Extruder count, read from Moonraker once and reused afterwards.
    fn cached_extruder_count(&self) -> Result<usize> {
        if let Some(count) = *self.extruders.lock() {
            return Ok(count);
        }
        let count = self.extruder_count()?;
        *self.extruders.lock() = Some(count);
        Ok(count)
    }
}

impl PrinterControl for PrinterService {
    fn pause(&self) -> Result<()> {
        self.pause_print()
    }

    fn stop(&self) -> Result<()> {
        self.cancel_print()
    }

    fn shutoff_heaters(&self) -> Result<()> {
        if let Err(e) = self.save_targets() {
            warn!("Could not save heater targets: {}", e);
        }
        self.run_gcode("TURN_OFF_HEATERS")
    }

    fn shutoff_extruder(&self) -> Result<()> {
        self.run_gcode("SET_STEPPER_ENABLE STEPPER=extruder ENABLE=0")
    }

    fn restart(&self) -> Result<()> {
        let saved = self.saved_targets.lock().take();
        // restore what we can, the resume is attempted regardless
        for command in saved.map(|s| s.restore_commands()).unwrap_or_default() {
            match self.run_gcode(&command) {
                Ok(()) => info!("Restored heater target: {}", command),
                Err(e) => warn!("Failed to restore heater target '{}': {}", command, e),
            }
        }
        self.resume_print()
    }
}

impl TelemetrySource for PrinterService {
    fn current_printer_state(&self) -> Result<PrinterSnapshot> {
        let extruders = self.cached_extruder_count()?;
        let mut objects = vec![
            "webhooks".to_string(),
            "print_stats".to_string(),
            "virtual_sdcard".to_string(),
            "gcode_move".to_string(),
            "heater_bed".to_string(),
            "temperature_sensor chamber".to_string(),
            "heater_generic chamber".to_string(),
        ];
        objects.extend((0..extruders).map(extruder_object));

        let data = self.query_objects(&objects, "query printer objects")?;
        Ok(snapshot_from_status(&data, extruders))
    }

    fn current_job_dimensions(&self, filename: &str) -> Result<Option<JobDimensions>> {
        let objects =
            self.query_objects(&["exclude_object=objects".to_string()], "query job objects")?;
        let Some((width, depth)) = footprint(&objects) else {
            return Ok(None);
        };
        let metadata = self.get(
            "/server/files/metadata",
            &[("filename", filename)],
            "read file metadata",
        )?;
        let height = metadata["result"]["object_height"].as_f64().unwrap_or(0.0);
        Ok(Some(JobDimensions {
            width,
            depth,
            height,
        }))
    }

    fn job_history_last_success(&self, filename: &str) -> Result<bool> {
        let data = self.get(
            "/server/history/list",
            &[("limit", "50"), ("order", "desc")],
            "read job history",
        )?;
        Ok(last_run_succeeded(&data, filename))
    }

    fn extruder_count(&self) -> Result<usize> {
        let count = self.heater_objects()?.iter().filter(|o| is_extruder(o)).count();
        Ok(count.max(1))
    }
}

fn extruder_object(index: usize) -> String {
    if index == 0 {
        "extruder".to_string()
    } else {
        format!("extruder{}", index)
    }
}

fn is_extruder(name: &str) -> bool {
    name.strip_prefix("extruder")
        .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
}

fn object_names(data: &Value) -> Vec<String> {
    data["result"]["objects"]
        .as_array()
        .map(|objects| {
            objects
                .iter()
                .filter_map(|o| o.as_str().map(ToOwned::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

/// Map Klipper/Moonraker states onto the printer-state enumeration.
pub fn printer_state(webhooks_state: Option<&str>, print_state: Option<&str>) -> PrinterState {
    match webhooks_state {
        Some("startup") => return PrinterState::Connecting,
        Some("shutdown") => return PrinterState::ClosedWithError,
        Some("error") => return PrinterState::Error,
        _ => {}
    }
    match print_state {
        Some("printing") => PrinterState::Printing,
        Some("paused") => PrinterState::Paused,
        Some("standby") | Some("complete") | Some("cancelled") => PrinterState::Operational,
        Some("error") => PrinterState::Error,
        Some(_) => PrinterState::Unknown,
        None => PrinterState::Unknown,
    }
}

fn reading(object: &Value) -> Option<TemperatureReading> {
    if object.is_null() {
        return None;
    }
    Some(TemperatureReading {
        actual: object["temperature"].as_f64(),
        target: object["target"].as_f64(),
        offset: None,
    })
}

/// Build a snapshot from a Moonraker `objects/query` response.
pub fn snapshot_from_status(data: &Value, extruders: usize) -> PrinterSnapshot {
    let status = &data["result"]["status"];
    let print_stats = &status["print_stats"];

    let chamber = reading(&status["temperature_sensor chamber"])
        .or_else(|| reading(&status["heater_generic chamber"]));

    PrinterSnapshot {
        state: printer_state(
            status["webhooks"]["state"].as_str(),
            print_stats["state"].as_str(),
        ),
        sd_ready: !status["virtual_sdcard"].is_null(),
        job_file: print_stats["filename"]
            .as_str()
            .filter(|f| !f.is_empty())
            .map(ToOwned::to_owned),
        print_time: print_stats["print_duration"].as_f64(),
        current_z: status["gcode_move"]["gcode_position"][2].as_f64(),
        resend_ratio: None,
        temperatures: Temperatures {
            bed: reading(&status["heater_bed"]),
            chamber,
            tools: (0..extruders)
                .map(|i| reading(&status[extruder_object(i).as_str()]))
                .collect(),
        },
    }
}

/// Width and depth of the bounding box of all excluded-object polygons.
pub fn footprint(data: &Value) -> Option<(f64, f64)> {
    let objects = data["result"]["status"]["exclude_object"]["objects"].as_array()?;
    let points: Vec<(f64, f64)> = objects
        .iter()
        .filter_map(|o| o["polygon"].as_array())
        .flatten()
        .filter_map(|p| Some((p[0].as_f64()?, p[1].as_f64()?)))
        .collect();
    if points.is_empty() {
        return None;
    }
    let (min_x, max_x, min_y, max_y) = points.iter().fold(
        (f64::MAX, f64::MIN, f64::MAX, f64::MIN),
        |(min_x, max_x, min_y, max_y), &(x, y)| {
            (min_x.min(x), max_x.max(x), min_y.min(y), max_y.max(y))
        },
    );
    Some((max_x - min_x, max_y - min_y))
}

/// Whether the newest history entry for `filename` completed.
pub fn last_run_succeeded(data: &Value, filename: &str) -> bool {
    data["result"]["jobs"]
        .as_array()
        .and_then(|jobs| jobs.iter().find(|j| j["filename"].as_str() == Some(filename)))
        .is_some_and(|job| job["status"].as_str() == Some("completed"))
}

/// Commands from a `gcode_store` response newer than `since`.
pub fn gcode_commands_since(data: &Value, since: f64) -> Vec<(f64, String)> {
    let mut lines: Vec<(f64, String)> = data["result"]["gcode_store"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter(|e| e["type"].as_str() == Some("command"))
                .filter_map(|e| Some((e["time"].as_f64()?, e["message"].as_str()?.to_string())))
                .filter(|(time, _)| *time > since)
                .collect()
        })
        .unwrap_or_default();
    lines.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    lines
}
