//! Background sampling task and inference worker.
//!
//! The sampler thread wakes once per period, collects one feature vector and
//! hands a batch to the inference worker every `batch_size` cycles. The two
//! threads are connected by a single-slot channel: when the worker is still
//! busy with the previous batch the new one is skipped, so a slow inference
//! call never delays feature collection.
//!
//! Stop requests travel over a channel and are only observed between cycles.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::config::constants;
use crate::detector::DetectorCore;
use crate::features::FeatureVector;

/// What the background task does each period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SamplerMode {
    /// Full feature collection and batch submission.
    Sampling,
    /// Liveness pings only, while the print is paused.
    Heartbeat,
}

impl SamplerMode {
    fn period(self, sample_period: Duration) -> Duration {
        match self {
            SamplerMode::Sampling => sample_period,
            SamplerMode::Heartbeat => Duration::from_secs(constants::HEARTBEAT_SECONDS),
        }
    }
}

/// Consecutive vectors handed to inference, tagged with the session they
/// were sampled in.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub session: u64,
    pub vectors: Vec<FeatureVector>,
}

/// Handle to a running sampler thread.
pub struct Sampler {
    mode: SamplerMode,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Sampler {
    /// Start the sampler (and, when sampling, its inference worker).
    pub(crate) fn spawn(core: Arc<DetectorCore>, mode: SamplerMode) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel();
        let period = mode.period(core.sample_period());

        let batch_tx = match mode {
            SamplerMode::Sampling => Some(spawn_worker(Arc::clone(&core))),
            SamplerMode::Heartbeat => None,
        };

        let handle = thread::spawn(move || run_loop(core, mode, period, stop_rx, batch_tx));
        info!("Sampler started in {:?} mode (period {:?})", mode, period);

        Self {
            mode,
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn mode(&self) -> SamplerMode {
        self.mode
    }

    /// Signal the loop to exit and wait for the in-flight cycle to finish.
    pub fn stop(mut self) {
        self.signal_and_join();
    }

    fn signal_and_join(&mut self) {
        // a closed channel means the loop already exited
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Sampler thread panicked");
            }
            info!("Sampler stopped ({:?} mode)", self.mode);
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.signal_and_join();
    }
}

fn run_loop(
    core: Arc<DetectorCore>,
    mode: SamplerMode,
    period: Duration,
    stop_rx: Receiver<()>,
    batch_tx: Option<SyncSender<Batch>>,
) {
    loop {
        if core.is_shut_down() {
            break;
        }
        let started = Instant::now();

        match mode {
            SamplerMode::Sampling => run_sampling_cycle(&core, batch_tx.as_ref()),
            SamplerMode::Heartbeat => core.heartbeat(),
        }

        let wait = period.saturating_sub(started.elapsed());
        match stop_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    debug!("Sampler loop exited");
}

fn run_sampling_cycle(core: &DetectorCore, batch_tx: Option<&SyncSender<Batch>>) {
    let batch = match core.sample_once(Instant::now()) {
        Ok(Some(batch)) => batch,
        Ok(None) => return,
        Err(e) => {
            error!("Sampling cycle failed: {}", e);
            return;
        }
    };

    if !core.should_submit() {
        debug!("Inference degraded, keeping batch local");
        return;
    }

    let Some(tx) = batch_tx else {
        return;
    };
    match tx.try_send(batch) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!("Inference still busy with the previous batch, skipping this one")
        }
        Err(TrySendError::Disconnected(_)) => error!("Inference worker is gone"),
    }
}

fn spawn_worker(core: Arc<DetectorCore>) -> SyncSender<Batch> {
    let (tx, rx) = mpsc::sync_channel::<Batch>(1);
    thread::spawn(move || {
        for batch in rx {
            if core.is_shut_down() {
                break;
            }
            core.process_batch(batch, Instant::now());
        }
        debug!("Inference worker exited");
    });
    tx
}
