//! Threshold policy and corrective action trigger.
//!
//! ```text
//!            ratio >= notify && conf >= min
//!   Idle ─────────────────────────────────> Notified
//!    │  ^                                      │
//!    │  └────── all windows below notify ──────┘
//!    │                                          │ ratio >= action
//!    └──────────── ratio >= action ──────> ActionTriggered ──> Cooldown
//!                                                                 │
//!   Idle <──────────── timer expiry / explicit reset ─────────────┘
//! ```
//!
//! Windows are combined by union: the most sensitive qualifying window
//! decides.

use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;

use crate::config::Settings;
use crate::outliers::WindowStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PolicyState {
    Idle,
    Notified,
    ActionTriggered,
    Cooldown,
}

/// One corrective command sent to the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CorrectiveAction {
    Pause,
    Stop,
    ShutoffHeaters,
    ShutoffExtruder,
    /// Restore a shut-off print after the user resumes it.
    Restart,
}

impl CorrectiveAction {
    pub fn describe(self) -> &'static str {
        match self {
            CorrectiveAction::Pause => "pause print",
            CorrectiveAction::Stop => "stop print",
            CorrectiveAction::ShutoffHeaters => "shut off heaters",
            CorrectiveAction::ShutoffExtruder => "shut off extruder",
            CorrectiveAction::Restart => "restart print",
        }
    }
}

/// Which corrective commands the user has enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionSet {
    pub stop: bool,
    pub shutoff_heaters: bool,
    pub shutoff_extruder: bool,
}

impl ActionSet {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            stop: settings.enable_stop,
            shutoff_heaters: settings.enable_shutoff,
            shutoff_extruder: settings.enable_extruder_shutoff,
        }
    }

    /// Commands fired when the action threshold is crossed: stop or pause,
    /// then the shutoff sequence.
    pub fn trigger_actions(&self) -> Vec<CorrectiveAction> {
        let mut actions = vec![if self.stop {
            CorrectiveAction::Stop
        } else {
            CorrectiveAction::Pause
        }];
        actions.extend(self.shutoff_sequence());
        actions
    }

    /// Commands run when a triggered print pauses or ends.
    pub fn shutoff_sequence(&self) -> Vec<CorrectiveAction> {
        let mut actions = Vec::new();
        if self.shutoff_heaters {
            actions.push(CorrectiveAction::ShutoffHeaters);
        }
        if self.shutoff_extruder {
            actions.push(CorrectiveAction::ShutoffExtruder);
        }
        actions
    }
}

/// Percent thresholds the policy evaluates against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub notification: f64,
    pub action: f64,
    pub confidence: f64,
}

impl Thresholds {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            notification: settings.notification_threshold,
            action: settings.action_threshold,
            confidence: settings.confidence,
        }
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    None,
    /// Raise a UI warning.
    Notify { window: usize, ratio_percent: f64 },
    /// Fire the corrective actions.
    Act {
        window: usize,
        ratio_percent: f64,
        actions: Vec<CorrectiveAction>,
    },
}

/// Cooldown bookkeeping after an action fired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CooldownState {
    pub triggered_at: Instant,
    pub duration: Duration,
    /// Qualifying triggers swallowed while cooling down.
    pub suppressed: u32,
}

impl CooldownState {
    pub fn remaining(&self, now: Instant) -> Duration {
        self.duration
            .saturating_sub(now.saturating_duration_since(self.triggered_at))
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }
}

/// Threshold state machine.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    state: PolicyState,
    thresholds: Thresholds,
    actions: ActionSet,
    cooldown_duration: Duration,
    cooldown: Option<CooldownState>,
    total_suppressed: u64,
    triggers: u64,
}

impl ThresholdPolicy {
    pub fn new(thresholds: Thresholds, actions: ActionSet, cooldown: Duration) -> Self {
        Self {
            state: PolicyState::Idle,
            thresholds,
            actions,
            cooldown_duration: cooldown,
            cooldown: None,
            total_suppressed: 0,
            triggers: 0,
        }
    }

    pub fn from_settings(settings: &Settings, cooldown: Duration) -> Self {
        Self::new(
            Thresholds::from_settings(settings),
            ActionSet::from_settings(settings),
            cooldown,
        )
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn actions(&self) -> ActionSet {
        self.actions
    }

    pub fn cooldown(&self) -> Option<CooldownState> {
        self.cooldown
    }

    /// Triggers swallowed by cooldown since the last reset.
    pub fn suppressed_triggers(&self) -> u64 {
        self.total_suppressed
    }

    /// Actions fired since the last reset.
    pub fn trigger_count(&self) -> u64 {
        self.triggers
    }

    /// Apply new settings. Thresholds take effect at the next evaluation.
    pub fn update_settings(&mut self, settings: &Settings) {
        self.thresholds = Thresholds::from_settings(settings);
        self.actions = ActionSet::from_settings(settings);
    }

    /// Advance the cooldown timer alone.
    pub fn tick(&mut self, now: Instant) {
        if self.state == PolicyState::Cooldown
            && self.cooldown.is_some_and(|c| c.expired(now))
        {
            info!("Cooldown expired, returning to idle");
            self.state = PolicyState::Idle;
            self.cooldown = None;
        }
    }

    /// Evaluate window statistics and the newest verdict's confidence.
    pub fn evaluate(
        &mut self,
        windows: &[WindowStats],
        confidence_percent: f64,
        now: Instant,
    ) -> Decision {
        self.tick(now);

        let action_hit = most_sensitive(windows, self.thresholds.action);
        let notify_hit = most_sensitive(windows, self.thresholds.notification)
            .filter(|_| confidence_percent >= self.thresholds.confidence);

        match self.state {
            PolicyState::Cooldown => {
                if let (Some((window, ratio)), Some(cooldown)) = (action_hit, self.cooldown.as_mut())
                {
                    cooldown.suppressed += 1;
                    self.total_suppressed += 1;
                    warn!(
                        "Suppressed trigger on window {} ({:.1}%), cooldown {:?} remaining",
                        window,
                        ratio,
                        cooldown.remaining(now)
                    );
                }
                Decision::None
            }
            PolicyState::Idle | PolicyState::Notified | PolicyState::ActionTriggered => {
                if let Some((window, ratio_percent)) = action_hit {
                    self.fire(now);
                    return Decision::Act {
                        window,
                        ratio_percent,
                        actions: self.actions.trigger_actions(),
                    };
                }
                match (self.state, notify_hit) {
                    (PolicyState::Idle, Some((window, ratio_percent))) => {
                        info!(
                            "Outlier ratio {:.1}% on window {} reached warning threshold",
                            ratio_percent, window
                        );
                        self.state = PolicyState::Notified;
                        Decision::Notify {
                            window,
                            ratio_percent,
                        }
                    }
                    (PolicyState::Notified, None) => {
                        self.state = PolicyState::Idle;
                        Decision::None
                    }
                    _ => Decision::None,
                }
            }
        }
    }

    fn fire(&mut self, now: Instant) {
        self.state = PolicyState::ActionTriggered;
        self.triggers += 1;
        info!("Action threshold reached, firing corrective actions");
        self.cooldown = Some(CooldownState {
            triggered_at: now,
            duration: self.cooldown_duration,
            suppressed: 0,
        });
        self.state = PolicyState::Cooldown;
    }

    /// Whether a warning is pending (notified or cooling down).
    pub fn warning_pending(&self) -> bool {
        matches!(self.state, PolicyState::Notified | PolicyState::Cooldown)
    }

    /// Drop any pending warning or cooldown and return to idle.
    pub fn reset_cooldown(&mut self) {
        if self.state != PolicyState::Idle {
            info!("Policy reset from {:?} to idle", self.state);
        }
        self.state = PolicyState::Idle;
        self.cooldown = None;
    }

    /// Fresh session: idle, no cooldown, counters cleared.
    pub fn reset(&mut self) {
        self.reset_cooldown();
        self.total_suppressed = 0;
        self.triggers = 0;
    }
}

/// The qualifying window with the highest ratio, as `(size, percent)`.
fn most_sensitive(windows: &[WindowStats], threshold_percent: f64) -> Option<(usize, f64)> {
    windows
        .iter()
        .filter(|w| w.samples > 0 && w.ratio_percent() >= threshold_percent)
        .map(|w| (w.size, w.ratio_percent()))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}
