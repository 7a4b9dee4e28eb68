use std::time::Duration;

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Settings;
use crate::error::InferenceError;
use crate::features::FeatureVector;

/// Judgment returned by the inference service for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceVerdict {
    /// Whether the batch looks defective.
    #[serde(alias = "defective")]
    pub is_outlier: bool,

    /// Raw confidence score, 0.0 to 1.0.
    pub score: f64,
}

impl InferenceVerdict {
    pub fn new(is_outlier: bool, score: f64) -> Self {
        Self { is_outlier, score }
    }

    /// Confidence as a percentage.
    pub fn confidence_percent(&self) -> f64 {
        self.score * 100.0
    }
}

/// Remote defect-inference service.
///
/// Implementations must bound every call with a timeout and report it as
/// [`InferenceError::Timeout`].
pub trait InferenceService: Send + Sync {
    /// Classify a batch of consecutive feature vectors.
    fn submit(&self, batch: &[FeatureVector]) -> Result<InferenceVerdict, InferenceError>;

    /// Report a user-labelled defect class for the current print.
    fn send_feedback(&self, _class: &str) -> Result<(), InferenceError> {
        Ok(())
    }

    /// Pick up changed user settings (API key, email preferences, ...).
    fn configure(&self, _settings: &Settings) {}
}

/// Blocking HTTP client for the inference service.
///
/// Batches are posted as JSON to `{base_url}/api/v2/anomaly`, feedback to
/// `{base_url}/api/v2/feedback`.
pub struct InferenceClient {
    base_url: String,
    timeout: Duration,
    client: reqwest::blocking::Client,
    settings: RwLock<Settings>,
}

impl InferenceClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Root URL of the inference service
    /// * `timeout` - Upper bound for a single request
    /// * `settings` - Initial user settings sent along with each batch
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(
        base_url: String,
        timeout: Duration,
        settings: Settings,
    ) -> Result<Self, InferenceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::RequestFailed {
                url: base_url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client,
            settings: RwLock::new(settings),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn post(&self, url: String, body: serde_json::Value) -> Result<String, InferenceError> {
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .map_err(|e| self.map_transport_error(&url, e))?;

        if !response.status().is_success() {
            return Err(InferenceError::RequestFailed {
                url,
                reason: format!("HTTP {}", response.status()),
            });
        }

        response.text().map_err(|e| self.map_transport_error(&url, e))
    }

    fn map_transport_error(&self, url: &str, err: reqwest::Error) -> InferenceError {
        if err.is_timeout() {
            InferenceError::Timeout {
                url: url.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            InferenceError::RequestFailed {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

impl InferenceService for InferenceClient {
    fn submit(&self, batch: &[FeatureVector]) -> Result<InferenceVerdict, InferenceError> {
        let body = {
            let settings = self.settings.read();
            json!({
                "api_key": settings.api_key,
                "stream_url": settings.stream_url,
                "email_addr": settings.email_addr,
                "enable_email_notification": settings.enable_email_notification,
                "buffer_length": settings.buffer_length,
                "buffer_percent": settings.buffer_percent,
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "features": batch,
            })
        };

        let url = format!("{}/api/v2/anomaly", self.base_url);
        debug!("Submitting batch of {} vectors to {}", batch.len(), url);
        let text = self.post(url, body)?;
        parse_verdict(&text)
    }

    fn send_feedback(&self, class: &str) -> Result<(), InferenceError> {
        let body = {
            let settings = self.settings.read();
            json!({
                "api_key": settings.api_key,
                "class": class,
                "enable_feedback_images": settings.enable_feedback_images,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })
        };
        self.post(format!("{}/api/v2/feedback", self.base_url), body)?;
        Ok(())
    }

    fn configure(&self, settings: &Settings) {
        *self.settings.write() = settings.clone();
    }
}

/// Parse a verdict body, rejecting non-finite scores.
pub fn parse_verdict(body: &str) -> Result<InferenceVerdict, InferenceError> {
    let verdict: InferenceVerdict =
        serde_json::from_str(body).map_err(|e| InferenceError::BadResponse {
            reason: e.to_string(),
        })?;
    if !verdict.score.is_finite() {
        return Err(InferenceError::BadResponse {
            reason: format!("score {} is not finite", verdict.score),
        });
    }
    Ok(verdict)
}
