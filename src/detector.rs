use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::alerts::{Notification, NotificationSink};
use crate::config::{Config, Settings, constants};
use crate::error::{ActionError, ConfigError, InferenceError, SentinelError, TelemetryError};
use crate::features::{self, FeatureBuffer, JobContext, PrinterState};
use crate::inference::InferenceService;
use crate::lifecycle::{GcodeEffect, LifecycleContext, PrintEvent};
use crate::outliers::{OutlierWindowTracker, WindowStats};
use crate::policy::{CorrectiveAction, Decision, PolicyState, ThresholdPolicy};
use crate::printer::PrinterControl;
use crate::sampler::{Batch, Sampler, SamplerMode};
use crate::telemetry::TelemetrySource;

/// External systems the detector drives.
#[derive(Clone)]
pub struct Collaborators {
    pub telemetry: Arc<dyn TelemetrySource>,
    pub inference: Arc<dyn InferenceService>,
    pub printer: Arc<dyn PrinterControl>,
    pub notifier: Arc<dyn NotificationSink>,
}

/// Mutable per-print state. Guarded by one mutex so appends and window
/// updates never interleave.
struct Session {
    id: u64,
    buffer: FeatureBuffer,
    tracker: OutlierWindowTracker,
    policy: ThresholdPolicy,
    context: LifecycleContext,
    /// A corrective action fired during this print.
    triggered: bool,
}

impl Session {
    fn reset(&mut self) {
        self.id += 1;
        self.buffer.clear();
        self.tracker.reset();
        self.policy.reset();
        self.triggered = false;
    }

    /// End the current session. Verdicts still in flight are discarded.
    fn close(&mut self) {
        self.id += 1;
    }
}

/// Consecutive-failure tracking for the inference service.
#[derive(Debug, Default)]
struct InferenceHealth {
    consecutive_failures: u32,
    offline_alert_sent: bool,
    batches_seen: u64,
}

impl InferenceHealth {
    fn degraded(&self) -> bool {
        self.consecutive_failures >= constants::MAX_INFERENCE_FAILURES
    }
}

/// Point-in-time view of the detector for UIs and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatus {
    pub printer_state: PrinterState,
    pub policy_state: PolicyState,
    pub triggered: bool,
    pub samples: usize,
    pub arity: usize,
    pub windows: Vec<WindowStats>,
    pub verdicts: u64,
    /// Moving average of the last `buffer_length` scores.
    pub score_average: f64,
    pub suppressed_triggers: u64,
    pub cooldown_remaining_secs: Option<f64>,
    pub sampler: Option<SamplerMode>,
    pub inference_degraded: bool,
    pub feedrate: f64,
    pub feedrate_percent: f64,
}

/// State shared between the event path, the sampler and the inference worker.
pub(crate) struct DetectorCore {
    sample_period: Duration,
    batch_size: usize,
    extruders: usize,
    session: Mutex<Session>,
    settings: RwLock<Settings>,
    health: Mutex<InferenceHealth>,
    collaborators: Collaborators,
    shutdown: AtomicBool,
}

impl DetectorCore {
    pub(crate) fn sample_period(&self) -> Duration {
        self.sample_period
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Collect one feature vector. Returns a batch every `batch_size` cycles.
    pub(crate) fn sample_once(&self, now: Instant) -> Result<Option<Batch>, SentinelError> {
        let telemetry = &self.collaborators.telemetry;
        let snapshot = telemetry
            .current_printer_state()
            .map_err(|e| TelemetryError::Unavailable {
                reason: e.to_string(),
            })?;

        let job = match snapshot.job_file.as_deref() {
            Some(file) => JobContext {
                dimensions: telemetry.current_job_dimensions(file).unwrap_or_else(|e| {
                    log_missing("job dimensions", e);
                    None
                }),
                last_success: telemetry.job_history_last_success(file).unwrap_or_else(|e| {
                    log_missing("job history", e);
                    false
                }),
            },
            None => JobContext::default(),
        };

        let mut session = self.session.lock();
        let motion = session.context.motion(now);
        let vector = features::assemble(&snapshot, job, motion, self.extruders);
        if let Err(e) = session.buffer.append(vector) {
            error!("Dropping invalid feature vector: {}", e);
            return Err(e.into());
        }

        let len = session.buffer.len();
        debug!("Sampled feature vector #{} ({:?})", len, snapshot.state);
        if len % self.batch_size != 0 {
            return Ok(None);
        }
        Ok(Some(Batch {
            session: session.id,
            vectors: session.buffer.latest(self.batch_size).to_vec(),
        }))
    }

    /// Whether the next batch should go to the inference service.
    ///
    /// While degraded only every n-th batch is sent, as a recovery probe.
    pub(crate) fn should_submit(&self) -> bool {
        let mut health = self.health.lock();
        health.batches_seen += 1;
        !health.degraded() || health.batches_seen % constants::DEGRADED_PROBE_INTERVAL == 0
    }

    /// Submit a batch, record the verdict and act on the policy's decision.
    pub(crate) fn process_batch(&self, batch: Batch, now: Instant) -> Option<Decision> {
        if self.is_shut_down() {
            return None;
        }

        let verdict = match self.collaborators.inference.submit(&batch.vectors) {
            Ok(verdict) => {
                self.record_inference_success();
                verdict
            }
            Err(e) => {
                self.record_inference_failure(&e);
                return None;
            }
        };

        let enabled = self.settings.read().enable_detector;
        let (decision, ratios) = {
            let mut session = self.session.lock();
            if session.id != batch.session {
                debug!("Discarding verdict from a previous print session");
                return None;
            }
            session.tracker.record(verdict);
            let stats = session.tracker.stats();
            let decision = if enabled {
                session
                    .policy
                    .evaluate(&stats, verdict.confidence_percent(), now)
            } else {
                Decision::None
            };
            if matches!(decision, Decision::Act { .. }) {
                session.triggered = true;
            }
            let ratios = stats.iter().map(|w| (w.size, w.ratio_percent())).collect();
            (decision, ratios)
        };

        info!(
            "Inference verdict: outlier={} score={:.3}",
            verdict.is_outlier, verdict.score
        );
        self.notify(Notification::Verdict {
            score: verdict.score,
            is_outlier: verdict.is_outlier,
            ratios_percent: ratios,
        });

        match &decision {
            Decision::None => {}
            Decision::Notify {
                window,
                ratio_percent,
            } => self.notify(Notification::Warning {
                window: *window,
                ratio_percent: *ratio_percent,
            }),
            Decision::Act {
                window,
                ratio_percent,
                actions,
            } => {
                warn!(
                    "Outlier ratio {:.1}% on window {} crossed the action threshold",
                    ratio_percent, window
                );
                self.execute(batch.session, actions);
                self.notify(Notification::ActionTaken {
                    window: *window,
                    ratio_percent: *ratio_percent,
                    actions: actions.clone(),
                });
            }
        }
        Some(decision)
    }

    fn record_inference_success(&self) {
        let recovered = {
            let mut health = self.health.lock();
            let was_offline = health.offline_alert_sent;
            health.consecutive_failures = 0;
            health.offline_alert_sent = false;
            was_offline
        };
        if recovered {
            info!("Inference service recovered");
            self.notify(Notification::InferenceRecovered);
        }
    }

    fn record_inference_failure(&self, err: &InferenceError) {
        if err.is_timeout() {
            warn!("Inference timed out, skipping this batch: {}", err);
        } else {
            warn!("Inference failed, skipping this batch: {}", err);
        }
        let offline = {
            let mut health = self.health.lock();
            health.consecutive_failures += 1;
            if health.degraded() && !health.offline_alert_sent {
                health.offline_alert_sent = true;
                Some(health.consecutive_failures)
            } else {
                None
            }
        };
        if let Some(failures) = offline {
            warn!(
                "Inference failed {} times in a row, continuing with feature collection only",
                failures
            );
            self.notify(Notification::InferenceOffline { failures });
        }
    }

    /// Run corrective actions for `session` in order. Failures are reported,
    /// not retried. Stops early on shutdown or once the session has ended.
    fn execute(&self, session: u64, actions: &[CorrectiveAction]) -> Vec<ActionError> {
        let mut failures = Vec::new();
        for &action in actions {
            if self.is_shut_down() {
                warn!("Shutdown requested, not executing {}", action.describe());
                break;
            }
            if self.session.lock().id != session {
                warn!("Print session ended, not executing {}", action.describe());
                break;
            }
            let printer = &self.collaborators.printer;
            let result = match action {
                CorrectiveAction::Pause => printer.pause(),
                CorrectiveAction::Stop => printer.stop(),
                CorrectiveAction::ShutoffHeaters => printer.shutoff_heaters(),
                CorrectiveAction::ShutoffExtruder => printer.shutoff_extruder(),
                CorrectiveAction::Restart => printer.restart(),
            };
            match result {
                Ok(()) => info!("Executed corrective action: {}", action.describe()),
                Err(e) => {
                    error!("Failed to {}: {}", action.describe(), e);
                    self.notify(Notification::ActionFailed {
                        action,
                        reason: e.to_string(),
                    });
                    failures.push(ActionError::ExecutionFailed {
                        action: action.describe().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        failures
    }

    pub(crate) fn heartbeat(&self) {
        let state = self.session.lock().context.state;
        self.notify(Notification::Heartbeat { state });
    }

    fn notify(&self, notification: Notification) {
        self.collaborators.notifier.notify(&notification);
    }
}

fn log_missing(field: &str, err: anyhow::Error) {
    let missing = TelemetryError::Missing {
        field: field.to_string(),
    };
    debug!("{} ({}), using default", missing, err);
}

/// Online print anomaly detector.
///
/// Reacts to print lifecycle events by starting and stopping the background
/// sampler, resets per-print state when a new print starts, and runs the
/// shutoff and restart sequences around a triggered print.
pub struct AnomalyDetector {
    core: Arc<DetectorCore>,
    sampler: Mutex<Option<Sampler>>,
}

impl AnomalyDetector {
    /// Create a detector. The sampler is not started until a print starts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for invalid window sizes, batch size, sample
    /// period or settings. These are the only startup-fatal errors.
    pub fn new(
        config: &Config,
        settings: Settings,
        collaborators: Collaborators,
    ) -> Result<Self, SentinelError> {
        config.validate()?;
        settings.validate()?;

        let extruders = collaborators.telemetry.extruder_count().unwrap_or_else(|e| {
            warn!("Could not read extruder count ({}), assuming 1", e);
            1
        });
        let arity = features::feature_arity(extruders);
        info!(
            "Detector configured for {} extruder(s), {} features per vector",
            extruders, arity
        );

        collaborators.inference.configure(&settings);
        let session = Session {
            id: 0,
            buffer: FeatureBuffer::new(arity),
            tracker: OutlierWindowTracker::new(&config.window_sizes)?,
            policy: ThresholdPolicy::from_settings(&settings, config.cooldown),
            context: LifecycleContext::default(),
            triggered: false,
        };

        Ok(Self {
            core: Arc::new(DetectorCore {
                sample_period: config.sample_period,
                batch_size: config.batch_size,
                extruders,
                session: Mutex::new(session),
                settings: RwLock::new(settings),
                health: Mutex::new(InferenceHealth::default()),
                collaborators,
                shutdown: AtomicBool::new(false),
            }),
            sampler: Mutex::new(None),
        })
    }

    /// React to a print lifecycle event.
    pub fn handle_event(&self, event: PrintEvent) {
        if self.core.is_shut_down() {
            debug!("Ignoring {:?} after shutdown", event);
            return;
        }
        info!("Print event: {:?}", event);
        let now = Instant::now();

        if event.is_terminal() || event == PrintEvent::Paused {
            // results for batches sampled before this point must not act
            self.core.session.lock().close();
        }

        match event {
            PrintEvent::Started => {
                self.stop_sampler();
                self.core.session.lock().reset();
                *self.core.health.lock() = InferenceHealth::default();
                self.core.notify(Notification::ResetPlot);
                self.start_sampler(SamplerMode::Sampling);
            }
            PrintEvent::Resumed => {
                if self.take_triggered() {
                    info!("Resuming a triggered print, restarting printer");
                    self.core
                        .execute(self.current_session(), &[CorrectiveAction::Restart]);
                }
                self.start_sampler(SamplerMode::Sampling);
            }
            PrintEvent::Paused => {
                self.run_shutoff_if_triggered();
                self.start_sampler(SamplerMode::Heartbeat);
            }
            PrintEvent::Cancelled | PrintEvent::Done | PrintEvent::Failed => {
                self.stop_sampler();
                self.run_shutoff_if_triggered();
                self.core.session.lock().triggered = false;
                self.core.notify(Notification::ResetPlot);
            }
            PrintEvent::ToolChange => self.core.session.lock().context.record_tool_change(now),
            PrintEvent::FilamentChange => {
                self.core.session.lock().context.record_filament_change(now)
            }
        }

        if let Some(state) = event.implied_state() {
            self.core.session.lock().context.state = state;
        }
    }

    fn current_session(&self) -> u64 {
        self.core.session.lock().id
    }

    /// Feed a sent gcode line to the feedrate and change tracking.
    pub fn observe_gcode(&self, line: &str) -> GcodeEffect {
        let effect = self
            .core
            .session
            .lock()
            .context
            .observe_gcode(line, Instant::now());
        if effect != GcodeEffect::Ignored {
            debug!("Gcode '{}' -> {:?}", line.trim(), effect);
        }
        effect
    }

    /// Apply saved settings.
    ///
    /// A pending warning or cooldown is cleared when thresholds change or a
    /// warning is outstanding, so the new policy applies immediately.
    pub fn save_settings(&self, settings: Settings) -> Result<(), ConfigError> {
        settings.validate()?;
        let previous = std::mem::replace(&mut *self.core.settings.write(), settings.clone());
        self.core.collaborators.inference.configure(&settings);
        {
            let mut session = self.core.session.lock();
            let pending = session.policy.warning_pending();
            session.policy.update_settings(&settings);
            if pending || previous.policy_changed(&settings) {
                session.policy.reset_cooldown();
            }
        }
        info!("Settings saved");
        self.core.notify(Notification::SettingsSaved);
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        self.core.settings.read().clone()
    }

    /// Forward a user defect report to the inference service.
    pub fn send_feedback(&self, class: &str) -> Result<(), InferenceError> {
        info!("Defect report sending to server for type: {}", class);
        self.core.collaborators.inference.send_feedback(class)
    }

    /// The user acknowledged a shutoff: clear the trigger and go idle.
    pub fn acknowledge(&self) {
        let mut session = self.core.session.lock();
        session.triggered = false;
        session.policy.reset_cooldown();
        info!("Shutoff acknowledged");
    }

    /// Stop the sampler and refuse further actions.
    pub fn shutdown(&self) {
        if self.core.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Detector shutting down");
        self.stop_sampler();
    }

    /// Run one sampling cycle on the caller's thread.
    pub fn run_cycle(&self) -> Result<Option<Batch>, SentinelError> {
        self.core.sample_once(Instant::now())
    }

    /// Submit a batch on the caller's thread and act on the verdict.
    pub fn process_batch(&self, batch: Batch) -> Option<Decision> {
        self.core.process_batch(batch, Instant::now())
    }

    pub fn sampler_mode(&self) -> Option<SamplerMode> {
        self.sampler.lock().as_ref().map(Sampler::mode)
    }

    pub fn status(&self) -> DetectorStatus {
        let sampler = self.sampler_mode();
        let inference_degraded = self.core.health.lock().degraded();
        let sma_length = self.core.settings.read().buffer_length as usize;
        let session = self.core.session.lock();
        let now = Instant::now();
        DetectorStatus {
            printer_state: session.context.state,
            policy_state: session.policy.state(),
            triggered: session.triggered,
            samples: session.buffer.len(),
            arity: session.buffer.arity(),
            windows: session.tracker.stats(),
            verdicts: session.tracker.total_recorded(),
            score_average: session.tracker.score_average(sma_length),
            suppressed_triggers: session.policy.suppressed_triggers(),
            cooldown_remaining_secs: session
                .policy
                .cooldown()
                .map(|c| c.remaining(now).as_secs_f64()),
            sampler,
            inference_degraded,
            feedrate: session.context.feedrate,
            feedrate_percent: session.context.feedrate_percent,
        }
    }

    /// Copy of the current session's feature vectors.
    pub fn samples(&self) -> Vec<features::FeatureVector> {
        self.core.session.lock().buffer.all().to_vec()
    }

    fn take_triggered(&self) -> bool {
        std::mem::take(&mut self.core.session.lock().triggered)
    }

    /// Run the shutoff sequence if an action fired this print.
    fn run_shutoff_if_triggered(&self) -> bool {
        let (id, sequence) = {
            let session = self.core.session.lock();
            if !session.triggered {
                return false;
            }
            (session.id, session.policy.actions().shutoff_sequence())
        };
        if !sequence.is_empty() {
            info!("Running shutoff sequence for triggered print");
            self.core.execute(id, &sequence);
        }
        true
    }

    fn start_sampler(&self, mode: SamplerMode) {
        let mut slot = self.sampler.lock();
        if let Some(existing) = slot.take() {
            existing.stop();
        }
        *slot = Some(Sampler::spawn(Arc::clone(&self.core), mode));
    }

    fn stop_sampler(&self) {
        let existing = self.sampler.lock().take();
        if let Some(existing) = existing {
            existing.stop();
        }
    }
}

impl Drop for AnomalyDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogSink;
    use crate::features::FeatureVector;
    use crate::inference::InferenceVerdict;
    use crate::telemetry::{JobDimensions, PrinterSnapshot};

    struct Idle;

    impl TelemetrySource for Idle {
        fn current_printer_state(&self) -> anyhow::Result<PrinterSnapshot> {
            Ok(PrinterSnapshot::default())
        }
        fn current_job_dimensions(&self, _: &str) -> anyhow::Result<Option<JobDimensions>> {
            Ok(None)
        }
        fn job_history_last_success(&self, _: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
        fn extruder_count(&self) -> anyhow::Result<usize> {
            Err(anyhow::anyhow!("no printer profile"))
        }
    }

    impl InferenceService for Idle {
        fn submit(&self, _: &[FeatureVector]) -> Result<InferenceVerdict, InferenceError> {
            Err(InferenceError::NotConfigured)
        }
    }

    impl PrinterControl for Idle {
        fn pause(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn shutoff_heaters(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn shutoff_extruder(&self) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("HTTP 500"))
        }
        fn restart(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn detector() -> AnomalyDetector {
        let idle = Arc::new(Idle);
        AnomalyDetector::new(
            &Config::default(),
            Settings::default(),
            Collaborators {
                telemetry: idle.clone(),
                inference: idle.clone(),
                printer: idle,
                notifier: Arc::new(LogSink),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_unknown_extruder_count_defaults_to_one() {
        let d = detector();
        assert_eq!(d.core.extruders, 1);
        assert_eq!(d.status().arity, features::feature_arity(1));
    }

    #[test]
    fn test_degraded_inference_only_submits_probes() {
        let d = detector();
        assert!(d.core.should_submit());
        d.core.health.lock().consecutive_failures = constants::MAX_INFERENCE_FAILURES;
        let submitted = (0..10).filter(|_| d.core.should_submit()).count();
        assert_eq!(submitted as u64, 10 / constants::DEGRADED_PROBE_INTERVAL);
    }

    #[test]
    fn test_failed_action_is_reported_and_sequence_continues() {
        let d = detector();
        let session = d.current_session();
        let failures = d.core.execute(session, &[
            CorrectiveAction::ShutoffExtruder,
            CorrectiveAction::ShutoffHeaters,
        ]);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].to_string().contains("shut off extruder"));
    }

    #[test]
    fn test_execute_stops_after_shutdown() {
        let d = detector();
        d.shutdown();
        assert!(d.core.execute(0, &[CorrectiveAction::ShutoffExtruder]).is_empty());
    }

    #[test]
    fn test_execute_skips_actions_of_a_closed_session() {
        let d = detector();
        let stale = d.current_session();
        d.core.session.lock().close();
        assert!(d.core.execute(stale, &[CorrectiveAction::ShutoffExtruder]).is_empty());
        assert_eq!(d.core.execute(stale + 1, &[CorrectiveAction::ShutoffExtruder]).len(), 1);
    }
}
