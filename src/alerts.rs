use anyhow::Result;
use log::{debug, error, info, warn};
use serde_json::json;

use crate::features::PrinterState;
use crate::policy::CorrectiveAction;

/// How urgently a notification needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// UI bookkeeping only (plots, acknowledgements).
    Ui,
    Info,
    Warning,
    Critical,
}

/// A message for the UI or an external alert channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A new verdict arrived; drives the UI plot.
    Verdict {
        score: f64,
        is_outlier: bool,
        ratios_percent: Vec<(usize, f64)>,
    },
    /// Outlier density crossed the warning threshold.
    Warning { window: usize, ratio_percent: f64 },
    /// Corrective actions were sent to the printer.
    ActionTaken {
        window: usize,
        ratio_percent: f64,
        actions: Vec<CorrectiveAction>,
    },
    /// A corrective action failed.
    ActionFailed {
        action: CorrectiveAction,
        reason: String,
    },
    /// Inference failed repeatedly; sampling continues without verdicts.
    InferenceOffline { failures: u32 },
    /// Inference answered again after an outage.
    InferenceRecovered,
    /// Clear the UI plot.
    ResetPlot,
    /// Settings were saved.
    SettingsSaved,
    /// Liveness ping while the print is paused.
    Heartbeat { state: PrinterState },
}

impl Notification {
    /// Short machine-readable tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Verdict { .. } => "verdict",
            Notification::Warning { .. } => "warning",
            Notification::ActionTaken { .. } => "action",
            Notification::ActionFailed { .. } => "actionFailed",
            Notification::InferenceOffline { .. } => "inferenceOffline",
            Notification::InferenceRecovered => "inferenceRecovered",
            Notification::ResetPlot => "resetPlot",
            Notification::SettingsSaved => "onSave",
            Notification::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Notification::Verdict { .. }
            | Notification::ResetPlot
            | Notification::SettingsSaved
            | Notification::Heartbeat { .. } => Severity::Ui,
            Notification::InferenceRecovered => Severity::Info,
            Notification::Warning { .. } | Notification::InferenceOffline { .. } => {
                Severity::Warning
            }
            Notification::ActionTaken { .. } | Notification::ActionFailed { .. } => {
                Severity::Critical
            }
        }
    }

    /// JSON payload for UI consumers.
    pub fn payload(&self) -> serde_json::Value {
        let body = match self {
            Notification::Verdict {
                score,
                is_outlier,
                ratios_percent,
            } => json!({
                "score": score,
                "is_outlier": is_outlier,
                "ratios": ratios_percent
                    .iter()
                    .map(|(window, ratio)| json!({"window": window, "percent": ratio}))
                    .collect::<Vec<_>>(),
            }),
            Notification::Warning {
                window,
                ratio_percent,
            } => json!({"window": window, "percent": ratio_percent}),
            Notification::ActionTaken {
                window,
                ratio_percent,
                actions,
            } => json!({"window": window, "percent": ratio_percent, "actions": actions}),
            Notification::ActionFailed { action, reason } => {
                json!({"action": action, "reason": reason})
            }
            Notification::InferenceOffline { failures } => json!({"failures": failures}),
            Notification::Heartbeat { state } => json!({"state": state, "code": state.code()}),
            Notification::InferenceRecovered
            | Notification::ResetPlot
            | Notification::SettingsSaved => json!({}),
        };
        json!({"type": self.kind(), "data": body})
    }

    /// Title and description for a human-facing alert.
    fn alert_text(&self) -> (&'static str, String) {
        match self {
            Notification::Warning {
                window,
                ratio_percent,
            } => (
                "Possible Print Defect",
                format!(
                    "**{:.1}%** of the last {} inference results look defective.",
                    ratio_percent, window
                ),
            ),
            Notification::ActionTaken {
                window,
                ratio_percent,
                actions,
            } => (
                "Print Defect Detected",
                format!(
                    "**{:.1}%** of the last {} inference results look defective.\n\n**Actions:**\n{}",
                    ratio_percent,
                    window,
                    actions
                        .iter()
                        .map(|a| format!("• {}", a.describe()))
                        .collect::<Vec<_>>()
                        .join("\n")
                ),
            ),
            Notification::ActionFailed { action, reason } => (
                "CRITICAL: Corrective Action Failed",
                format!("Failed to {}: {}. Please check the printer.", action.describe(), reason),
            ),
            Notification::InferenceOffline { failures } => (
                "Defect Detection Offline",
                format!(
                    "Inference failed {} times in a row. Telemetry is still collected.",
                    failures
                ),
            ),
            Notification::InferenceRecovered => (
                "RECOVERY: Defect Detection Back Online",
                "Inference service answered again.".to_string(),
            ),
            other => ("Print Sentinel", other.kind().to_string()),
        }
    }
}

/// Fire-and-forget sink for UI messages and alerts.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Sink that only writes to the log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notification: &Notification) {
        match notification.severity() {
            Severity::Ui => debug!("UI message: {}", notification.payload()),
            Severity::Info => info!("{}", notification.payload()),
            Severity::Warning => warn!("{}", notification.payload()),
            Severity::Critical => error!("{}", notification.payload()),
        }
    }
}

/// Discord alert service for sending rich embed notifications.
///
/// UI-only messages are logged and not posted.
pub struct AlertService {
    webhook_url: String,
}

impl AlertService {
    /// Create a new AlertService with the provided Discord webhook URL.
    pub fn new(webhook_url: String) -> Self {
        Self { webhook_url }
    }

    pub fn webhook_url(&self) -> &str {
        &self.webhook_url
    }

    /// Send a Discord alert with rich embed formatting.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The HTTP request fails
    /// - The Discord API returns an error status
    pub fn send_alert(&self, title: &str, description: &str, color: u32, emoji: &str) -> Result<()> {
        let timestamp = chrono::Utc::now().to_rfc3339();

        let embed = json!({
            "embeds": [{
                "title": format!("{} {}", emoji, title),
                "description": description,
                "color": color,
                "timestamp": timestamp,
                "footer": {
                    "text": "Print Sentinel"
                }
            }]
        });

        let client = reqwest::blocking::Client::new();
        let response = client
            .post(&self.webhook_url)
            .header("Content-Type", "application/json")
            .json(&embed)
            .send()?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Failed to send Discord alert: HTTP {}",
                response.status()
            ));
        }

        Ok(())
    }

    /// Post a notification as an embed.
    pub fn send_notification(&self, notification: &Notification) -> Result<()> {
        let (title, description) = notification.alert_text();
        let (color, emoji) = match notification.severity() {
            Severity::Critical => (0xFF0000, "🚨"),
            Severity::Warning => (0xFFA500, "⚠️"),
            Severity::Info | Severity::Ui => (0x00FF00, "✅"),
        };
        self.send_alert(title, &description, color, emoji)
    }
}

impl NotificationSink for AlertService {
    fn notify(&self, notification: &Notification) {
        if notification.severity() == Severity::Ui {
            debug!("UI message: {}", notification.payload());
            return;
        }
        match self.send_notification(notification) {
            Ok(()) => info!("Sent Discord {} alert", notification.kind()),
            Err(e) => error!("Failed to send Discord {} alert: {}", notification.kind(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let n = Notification::Warning {
            window: 10,
            ratio_percent: 40.0,
        };
        let payload = n.payload();
        assert_eq!(payload["type"], "warning");
        assert_eq!(payload["data"]["window"], 10);
        assert_eq!(payload["data"]["percent"], 40.0);
        assert_eq!(Notification::SettingsSaved.payload()["type"], "onSave");
    }

    #[test]
    fn test_action_failures_are_critical() {
        let n = Notification::ActionFailed {
            action: CorrectiveAction::Pause,
            reason: "HTTP 500".to_string(),
        };
        assert_eq!(n.severity(), Severity::Critical);
        assert!(Notification::ResetPlot.severity() < Severity::Info);
        let (title, description) = n.alert_text();
        assert!(title.contains("CRITICAL"));
        assert!(description.contains("pause print"));
    }

    #[test]
    fn test_discord_alert_to_unreachable_webhook_fails() {
        let service = AlertService::new("http://127.0.0.1:1/webhook".to_string());
        assert!(service.send_notification(&Notification::InferenceRecovered).is_err());
        // fire-and-forget path swallows the error
        service.notify(&Notification::InferenceRecovered);
    }
}
