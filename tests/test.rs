use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;

use print_sentinel::alerts::{Notification, NotificationSink};
use print_sentinel::config::{Config, Settings};
use print_sentinel::detector::{AnomalyDetector, Collaborators};
use print_sentinel::error::InferenceError;
use print_sentinel::features::{FeatureVector, PrinterState, feature_arity};
use print_sentinel::inference::{InferenceService, InferenceVerdict};
use print_sentinel::lifecycle::{GcodeEffect, PrintEvent};
use print_sentinel::policy::{CorrectiveAction, Decision, PolicyState};
use print_sentinel::printer::{PrinterControl, PrinterService};
use print_sentinel::sampler::SamplerMode;
use print_sentinel::telemetry::{
    JobDimensions, PrinterSnapshot, TelemetrySource, TemperatureReading, Temperatures,
};

struct MockTelemetry {
    offline: AtomicBool,
}

impl TelemetrySource for MockTelemetry {
    fn current_printer_state(&self) -> Result<PrinterSnapshot> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("printer unreachable"));
        }
        Ok(PrinterSnapshot {
            state: PrinterState::Printing,
            sd_ready: true,
            job_file: Some("cube.gcode".to_string()),
            print_time: Some(120.0),
            current_z: Some(2.4),
            resend_ratio: Some(0.0),
            temperatures: Temperatures {
                bed: Some(TemperatureReading::new(60.0, 60.0, 0.0)),
                chamber: None,
                tools: vec![Some(TemperatureReading::new(210.0, 210.0, 0.0))],
            },
        })
    }

    fn current_job_dimensions(&self, _filename: &str) -> Result<Option<JobDimensions>> {
        Ok(Some(JobDimensions {
            width: 20.0,
            depth: 20.0,
            height: 10.0,
        }))
    }

    fn job_history_last_success(&self, _filename: &str) -> Result<bool> {
        Err(anyhow!("history unavailable"))
    }

    fn extruder_count(&self) -> Result<usize> {
        Ok(1)
    }
}

enum Reply {
    Verdict(bool),
    Timeout,
    Fail,
}

#[derive(Default)]
struct MockInference {
    replies: Mutex<VecDeque<Reply>>,
    feedback: Mutex<Vec<String>>,
}

impl MockInference {
    fn script(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            feedback: Mutex::new(Vec::new()),
        }
    }
}

impl InferenceService for MockInference {
    fn submit(&self, _batch: &[FeatureVector]) -> Result<InferenceVerdict, InferenceError> {
        match self.replies.lock().pop_front().unwrap_or(Reply::Verdict(false)) {
            Reply::Verdict(is_outlier) => Ok(InferenceVerdict::new(is_outlier, 0.9)),
            Reply::Timeout => Err(InferenceError::Timeout {
                url: "mock".to_string(),
                timeout_ms: 5000,
            }),
            Reply::Fail => Err(InferenceError::RequestFailed {
                url: "mock".to_string(),
                reason: "HTTP 503".to_string(),
            }),
        }
    }

    fn send_feedback(&self, class: &str) -> Result<(), InferenceError> {
        self.feedback.lock().push(class.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct MockPrinter {
    calls: Mutex<Vec<CorrectiveAction>>,
}

impl MockPrinter {
    fn calls(&self) -> Vec<CorrectiveAction> {
        self.calls.lock().clone()
    }

    fn record(&self, action: CorrectiveAction) -> Result<()> {
        self.calls.lock().push(action);
        Ok(())
    }
}

impl PrinterControl for MockPrinter {
    fn pause(&self) -> Result<()> {
        self.record(CorrectiveAction::Pause)
    }
    fn stop(&self) -> Result<()> {
        self.record(CorrectiveAction::Stop)
    }
    fn shutoff_heaters(&self) -> Result<()> {
        self.record(CorrectiveAction::ShutoffHeaters)
    }
    fn shutoff_extruder(&self) -> Result<()> {
        self.record(CorrectiveAction::ShutoffExtruder)
    }
    fn restart(&self) -> Result<()> {
        self.record(CorrectiveAction::Restart)
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    fn count(&self, kind: &str) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|n| n.kind() == kind)
            .count()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: &Notification) {
        self.messages.lock().push(notification.clone());
    }
}

struct Harness {
    detector: AnomalyDetector,
    telemetry: Arc<MockTelemetry>,
    inference: Arc<MockInference>,
    printer: Arc<MockPrinter>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new(config: Config, settings: Settings, inference: MockInference) -> Self {
        let telemetry = Arc::new(MockTelemetry {
            offline: AtomicBool::new(false),
        });
        let inference = Arc::new(inference);
        let printer = Arc::new(MockPrinter::default());
        let sink = Arc::new(RecordingSink::default());
        let detector = AnomalyDetector::new(
            &config,
            settings,
            Collaborators {
                telemetry: telemetry.clone(),
                inference: inference.clone(),
                printer: printer.clone(),
                notifier: sink.clone(),
            },
        )
        .expect("valid configuration");
        Self {
            detector,
            telemetry,
            inference,
            printer,
            sink,
        }
    }

    /// One vector per cycle, one verdict per vector, a single 10-wide window.
    fn per_sample(settings: Settings, inference: MockInference) -> Self {
        Self::new(
            Config {
                batch_size: 1,
                window_sizes: vec![10],
                cooldown: Duration::from_secs(300),
                ..Config::default()
            },
            settings,
            inference,
        )
    }

    fn cycle(&self) -> Option<Decision> {
        let batch = self
            .detector
            .run_cycle()
            .expect("sampling succeeds")
            .expect("batch of one is always due");
        self.detector.process_batch(batch)
    }

    fn take_offline(&self) {
        self.telemetry.offline.store(true, Ordering::SeqCst);
    }
}

fn four_clean_then(outliers: usize) -> MockInference {
    MockInference::script(
        (0..4)
            .map(|_| Reply::Verdict(false))
            .chain((0..outliers).map(|_| Reply::Verdict(true))),
    )
}

fn shutoff_settings() -> Settings {
    Settings {
        enable_shutoff: true,
        ..Settings::default()
    }
}

#[test]
fn test_batch_due_every_batch_size_cycles() {
    let h = Harness::new(Config::default(), Settings::default(), MockInference::default());
    for cycle in 1..=20 {
        let batch = h.detector.run_cycle().expect("sampling succeeds");
        if cycle % 10 == 0 {
            let batch = batch.expect("batch due");
            assert_eq!(batch.vectors.len(), 10);
            assert!(batch.vectors.iter().all(|v| v.len() == feature_arity(1)));
        } else {
            assert!(batch.is_none(), "no batch expected at cycle {}", cycle);
        }
    }
    assert_eq!(h.detector.status().samples, 20);
    assert_eq!(h.detector.status().arity, 22);
}

#[test]
fn test_feature_vector_layout_from_snapshot() {
    let h = Harness::new(Config::default(), Settings::default(), MockInference::default());
    h.detector.run_cycle().expect("sampling succeeds");
    let samples = h.detector.samples();
    let values = samples[0].values();
    assert_eq!(values.len(), 22);
    assert_eq!(values[0], f64::from(PrinterState::Printing.code()));
    assert_eq!(values[1], 1.0);
    // history lookup failed, defaults to false
    assert_eq!(values[2], 0.0);
    assert_eq!(&values[5..8], &[1.0, 2.0, 2.0]);
    assert!(values.iter().all(|v| v.is_finite()));
}

#[test]
fn test_action_fires_once_and_cooldown_suppresses_next_trigger() {
    let h = Harness::per_sample(Settings::default(), four_clean_then(7));
    let mut fired = 0;
    let mut notified = 0;
    for _ in 0..11 {
        match h.cycle() {
            Some(Decision::Act { ratio_percent, .. }) => {
                assert_eq!(ratio_percent, 60.0);
                fired += 1;
            }
            Some(Decision::Notify { .. }) => notified += 1,
            _ => {}
        }
    }

    assert_eq!(fired, 1);
    assert_eq!(notified, 1);
    assert_eq!(h.printer.calls(), vec![CorrectiveAction::Pause]);
    let status = h.detector.status();
    assert!(status.triggered);
    assert_eq!(status.policy_state, PolicyState::Cooldown);
    assert_eq!(status.suppressed_triggers, 1);
    assert!(status.cooldown_remaining_secs.is_some());
    assert_eq!(h.sink.count("action"), 1);
    assert_eq!(h.sink.count("warning"), 1);
    assert_eq!(h.sink.count("verdict"), 11);
}

#[test]
fn test_stop_and_shutoff_actions_follow_settings() {
    let settings = Settings {
        enable_stop: true,
        enable_shutoff: true,
        enable_extruder_shutoff: true,
        ..Settings::default()
    };
    let h = Harness::per_sample(settings, four_clean_then(6));
    for _ in 0..10 {
        h.cycle();
    }
    assert_eq!(
        h.printer.calls(),
        vec![
            CorrectiveAction::Stop,
            CorrectiveAction::ShutoffHeaters,
            CorrectiveAction::ShutoffExtruder
        ]
    );
}

#[test]
fn test_disabled_detector_collects_but_never_acts() {
    let settings = Settings {
        enable_detector: false,
        ..Settings::default()
    };
    let h = Harness::per_sample(settings, MockInference::script((0..10).map(|_| Reply::Verdict(true))));
    for _ in 0..10 {
        assert_eq!(h.cycle(), Some(Decision::None));
    }
    assert!(h.printer.calls().is_empty());
    assert_eq!(h.detector.status().verdicts, 10);
}

#[test]
fn test_started_clears_previous_print() {
    let h = Harness::per_sample(Settings::default(), four_clean_then(6));
    for _ in 0..10 {
        h.cycle();
    }
    assert!(h.detector.status().triggered);

    // keep the freshly started sampler from adding vectors
    h.take_offline();
    h.detector.handle_event(PrintEvent::Started);

    let status = h.detector.status();
    assert_eq!(status.samples, 0);
    assert_eq!(status.verdicts, 0);
    assert!(!status.triggered);
    assert_eq!(status.policy_state, PolicyState::Idle);
    assert!(status.windows.iter().all(|w| w.samples == 0));
    assert_eq!(status.printer_state, PrinterState::Printing);
    assert_eq!(status.sampler, Some(SamplerMode::Sampling));
    assert_eq!(h.sink.count("resetPlot"), 1);
    h.detector.shutdown();
}

#[test]
fn test_verdict_from_previous_session_is_discarded() {
    let h = Harness::per_sample(Settings::default(), MockInference::default());
    let batch = h.detector.run_cycle().unwrap().unwrap();
    h.take_offline();
    h.detector.handle_event(PrintEvent::Started);
    assert_eq!(h.detector.process_batch(batch), None);
    assert_eq!(h.detector.status().verdicts, 0);
    h.detector.shutdown();
}

#[test]
fn test_pause_and_cancel_run_shutoff_after_trigger() {
    let h = Harness::per_sample(shutoff_settings(), four_clean_then(6));
    for _ in 0..10 {
        h.cycle();
    }
    assert_eq!(
        h.printer.calls(),
        vec![CorrectiveAction::Pause, CorrectiveAction::ShutoffHeaters]
    );
    h.take_offline();

    h.detector.handle_event(PrintEvent::Paused);
    assert_eq!(h.detector.sampler_mode(), Some(SamplerMode::Heartbeat));
    assert_eq!(h.printer.calls().len(), 3);
    assert!(h.detector.status().triggered);

    h.detector.handle_event(PrintEvent::Cancelled);
    assert_eq!(
        h.printer.calls()[3..],
        [CorrectiveAction::ShutoffHeaters]
    );
    let status = h.detector.status();
    assert!(!status.triggered);
    assert_eq!(status.sampler, None);
    assert_eq!(status.printer_state, PrinterState::Operational);

    // nothing triggered any more, a second terminal event does nothing
    h.detector.handle_event(PrintEvent::Done);
    assert_eq!(h.printer.calls().len(), 4);
}

#[test]
fn test_resume_after_trigger_restarts_printer() {
    let h = Harness::per_sample(shutoff_settings(), four_clean_then(6));
    for _ in 0..10 {
        h.cycle();
    }
    h.take_offline();
    h.detector.handle_event(PrintEvent::Paused);
    h.detector.handle_event(PrintEvent::Resumed);

    assert_eq!(h.printer.calls().last(), Some(&CorrectiveAction::Restart));
    let status = h.detector.status();
    assert!(!status.triggered);
    assert_eq!(status.sampler, Some(SamplerMode::Sampling));
    // cooldown survives the restart
    assert_eq!(status.policy_state, PolicyState::Cooldown);

    h.detector.handle_event(PrintEvent::Paused);
    assert_eq!(
        h.printer
            .calls()
            .iter()
            .filter(|a| **a == CorrectiveAction::Restart)
            .count(),
        1
    );
    h.detector.shutdown();
}

#[test]
fn test_verdict_sampled_before_cancel_does_not_act() {
    let h = Harness::per_sample(shutoff_settings(), four_clean_then(6));
    for _ in 0..9 {
        assert!(!matches!(h.cycle(), Some(Decision::Act { .. })));
    }
    // the tenth verdict would cross 60%, but the print ends first
    let in_flight = h.detector.run_cycle().unwrap().unwrap();
    h.take_offline();
    h.detector.handle_event(PrintEvent::Cancelled);

    assert_eq!(h.detector.process_batch(in_flight), None);
    assert!(h.printer.calls().is_empty());
    assert!(!h.detector.status().triggered);
}

#[test]
fn test_verdict_sampled_before_pause_does_not_act() {
    let h = Harness::per_sample(Settings::default(), four_clean_then(6));
    for _ in 0..9 {
        h.cycle();
    }
    let in_flight = h.detector.run_cycle().unwrap().unwrap();
    h.take_offline();
    h.detector.handle_event(PrintEvent::Paused);

    assert_eq!(h.detector.process_batch(in_flight), None);
    assert!(h.printer.calls().is_empty());
    h.detector.shutdown();
}

/// Inference that holds its first request until released.
struct HeldInference {
    gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl InferenceService for HeldInference {
    fn submit(&self, _batch: &[FeatureVector]) -> Result<InferenceVerdict, InferenceError> {
        let gate = self.gate.lock().take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv_timeout(Duration::from_secs(5));
        }
        Ok(InferenceVerdict::new(true, 0.9))
    }
}

#[test]
fn test_in_flight_inference_after_cancel_does_not_act() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let printer = Arc::new(MockPrinter::default());
    let detector = AnomalyDetector::new(
        &Config {
            sample_period: Duration::from_millis(10),
            batch_size: 1,
            window_sizes: vec![10],
            ..Config::default()
        },
        Settings::default(),
        Collaborators {
            telemetry: Arc::new(MockTelemetry {
                offline: AtomicBool::new(false),
            }),
            inference: Arc::new(HeldInference {
                gate: Mutex::new(Some((entered_tx, release_rx))),
            }),
            printer: printer.clone(),
            notifier: Arc::new(RecordingSink::default()),
        },
    )
    .expect("valid configuration");

    detector.handle_event(PrintEvent::Started);
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("inference request started");
    detector.handle_event(PrintEvent::Cancelled);
    release_tx.send(()).unwrap();

    thread::sleep(Duration::from_millis(200));
    assert!(printer.calls().is_empty());
    let status = detector.status();
    assert!(!status.triggered);
    assert_eq!(status.sampler, None);
}

#[test]
fn test_untriggered_pause_runs_nothing() {
    let h = Harness::per_sample(shutoff_settings(), MockInference::default());
    h.take_offline();
    h.detector.handle_event(PrintEvent::Started);
    h.detector.handle_event(PrintEvent::Paused);
    h.detector.handle_event(PrintEvent::Resumed);
    h.detector.handle_event(PrintEvent::Done);
    assert!(h.printer.calls().is_empty());
    assert_eq!(h.detector.status().printer_state, PrinterState::Operational);
}

#[test]
fn test_settings_save_resets_cooldown() {
    let h = Harness::per_sample(Settings::default(), four_clean_then(8));
    for _ in 0..10 {
        h.cycle();
    }
    assert_eq!(h.detector.status().policy_state, PolicyState::Cooldown);

    let saved = Settings {
        action_threshold: 65.0,
        ..Settings::default()
    };
    h.detector.save_settings(saved.clone()).expect("valid settings");
    let status = h.detector.status();
    assert_eq!(status.policy_state, PolicyState::Idle);
    assert!(status.cooldown_remaining_secs.is_none());
    assert_eq!(h.detector.settings(), saved);
    assert_eq!(h.sink.count("onSave"), 1);

    // 7/10 clears the new 65% threshold immediately
    assert!(matches!(h.cycle(), Some(Decision::Act { .. })));
    assert_eq!(h.printer.calls().len(), 2);
}

#[test]
fn test_invalid_settings_are_rejected() {
    let h = Harness::per_sample(Settings::default(), MockInference::default());
    let invalid = Settings {
        notification_threshold: 150.0,
        ..Settings::default()
    };
    assert!(h.detector.save_settings(invalid).is_err());
    assert_eq!(h.detector.settings(), Settings::default());
}

#[test]
fn test_acknowledge_clears_trigger() {
    let h = Harness::per_sample(Settings::default(), four_clean_then(6));
    for _ in 0..10 {
        h.cycle();
    }
    h.detector.acknowledge();
    let status = h.detector.status();
    assert!(!status.triggered);
    assert_eq!(status.policy_state, PolicyState::Idle);
}

#[test]
fn test_inference_timeout_leaves_windows_unchanged() {
    let h = Harness::per_sample(
        Settings::default(),
        MockInference::script([Reply::Verdict(true), Reply::Timeout]),
    );
    h.cycle();
    let before = h.detector.status().windows;
    assert_eq!(h.cycle(), None);
    let status = h.detector.status();
    assert_eq!(status.windows, before);
    assert_eq!(status.verdicts, 1);
    assert_eq!(status.samples, 2);
    assert_eq!(status.score_average, 0.9);
}

#[test]
fn test_repeated_inference_failures_alert_once_then_recover() {
    let h = Harness::per_sample(
        Settings::default(),
        MockInference::script([
            Reply::Fail,
            Reply::Timeout,
            Reply::Fail,
            Reply::Fail,
            Reply::Verdict(false),
            Reply::Fail,
        ]),
    );
    for _ in 0..4 {
        assert_eq!(h.cycle(), None);
    }
    assert!(h.detector.status().inference_degraded);
    assert_eq!(h.sink.count("inferenceOffline"), 1);

    assert_eq!(h.cycle(), Some(Decision::None));
    assert!(!h.detector.status().inference_degraded);
    assert_eq!(h.sink.count("inferenceRecovered"), 1);

    // a single failure after recovery is not an outage
    h.cycle();
    assert_eq!(h.sink.count("inferenceOffline"), 1);
}

#[test]
fn test_no_actions_after_shutdown() {
    let h = Harness::per_sample(Settings::default(), MockInference::script((0..10).map(|_| Reply::Verdict(true))));
    let batch = h.detector.run_cycle().unwrap().unwrap();
    h.detector.shutdown();
    assert_eq!(h.detector.process_batch(batch), None);
    h.detector.handle_event(PrintEvent::Started);
    assert_eq!(h.detector.sampler_mode(), None);
    assert!(h.printer.calls().is_empty());
}

#[test]
fn test_gcode_updates_motion_features() {
    let h = Harness::new(Config::default(), Settings::default(), MockInference::default());
    assert_eq!(
        h.detector.observe_gcode("G1 X10 Y5 F1500"),
        GcodeEffect::Feedrate(1500.0)
    );
    assert_eq!(
        h.detector.observe_gcode("M220 S150"),
        GcodeEffect::FeedratePercent(150.0)
    );
    assert_eq!(h.detector.observe_gcode("M600"), GcodeEffect::FilamentChange);
    assert_eq!(h.detector.observe_gcode("G1 F"), GcodeEffect::Ignored);

    h.detector.run_cycle().unwrap();
    let values = h.detector.samples()[0].values().to_vec();
    assert_eq!(values[9], 1.0);
    assert_eq!(values[10], 0.0);
    assert_eq!(values[11], 1500.0);
    assert_eq!(values[12], 150.0);
}

#[test]
fn test_feedback_is_forwarded() {
    let h = Harness::new(Config::default(), Settings::default(), MockInference::default());
    h.detector.send_feedback("spaghetti").unwrap();
    assert_eq!(*h.inference.feedback.lock(), vec!["spaghetti".to_string()]);
}

#[test]
fn test_invalid_window_sizes_are_fatal() {
    let collaborators = Collaborators {
        telemetry: Arc::new(MockTelemetry {
            offline: AtomicBool::new(false),
        }),
        inference: Arc::new(MockInference::default()),
        printer: Arc::new(MockPrinter::default()),
        notifier: Arc::new(RecordingSink::default()),
    };
    let config = Config {
        window_sizes: vec![10, 10],
        ..Config::default()
    };
    assert!(AnomalyDetector::new(&config, Settings::default(), collaborators).is_err());
}

#[test]
fn test_background_sampler_feeds_inference() {
    let h = Harness::new(
        Config {
            sample_period: Duration::from_millis(10),
            batch_size: 2,
            ..Config::default()
        },
        Settings::default(),
        MockInference::default(),
    );
    h.detector.handle_event(PrintEvent::Started);

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.detector.status().verdicts == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    let status = h.detector.status();
    assert!(status.samples >= 2);
    assert!(status.verdicts >= 1);

    h.detector.shutdown();
    assert_eq!(h.detector.sampler_mode(), None);
    let samples = h.detector.status().samples;
    thread::sleep(Duration::from_millis(50));
    assert_eq!(h.detector.status().samples, samples);
}

#[test]
fn test_printer_service_against_unreachable_server() {
    // Only checks struct creation and that commands fail without a server
    let url = "http://127.0.0.1:1".to_string();
    let printer = PrinterService::new(url.clone(), Duration::from_secs(1))
        .expect("client builds");
    assert_eq!(printer.api_url, url);
    assert!(printer.pause_print().is_err());
    assert!(printer.resume_print().is_err());
    assert!(printer.cancel_print().is_err());
    assert!(PrinterControl::pause(&printer).is_err());
    assert!(printer.current_printer_state().is_err());
}
