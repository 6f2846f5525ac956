//! Detection alerts.
//!
//! An inference loop that finds weapons hands an `Alert` to the process-wide
//! `AlertThrottle`, which forwards at most one alert per cooldown window to a
//! `Notifier`. The window is shared by all streams, so several cameras firing
//! together produce one notification.

mod notify;
mod throttle;

use serde::{Deserialize, Serialize};

use crate::detect::{ClassNames, Detection};
use crate::stream::StreamKey;

pub use notify::{FanoutNotifier, LogNotifier, MqttNotifier, Notifier, WebhookNotifier};
pub use throttle::{AlertOutcome, AlertThrottle};

/// One alert-worthy detection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alert {
    pub stream: StreamKey,
    pub label: String,
    pub confidence: f32,
    /// Local wall-clock time, `%Y-%m-%d %H:%M:%S`.
    pub timestamp: String,
}

impl Alert {
    pub fn new(stream: StreamKey, label: String, confidence: f32, timestamp: String) -> Self {
        Self {
            stream,
            label,
            confidence,
            timestamp,
        }
    }

    /// Build an alert for the detection chosen by `selection`, if any.
    pub fn from_detections(
        stream: &StreamKey,
        detections: &[Detection],
        class_names: &ClassNames,
        selection: AlertSelection,
        timestamp: String,
    ) -> Option<Self> {
        let top = selection.pick(detections)?;
        Some(Self::new(
            stream.clone(),
            class_names.label(top.class_id),
            top.confidence,
            timestamp,
        ))
    }

    /// Human-readable notification body.
    pub fn message(&self) -> String {
        format!(
            "WEAPON DETECTED!\n\nType: {}\nConfidence: {:.2}\nTime: {}\n\nLocation: Gun Detection System ({})",
            self.label, self.confidence, self.timestamp, self.stream
        )
    }
}

/// Which detection of a frame an alert reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSelection {
    /// First detection in detector output order.
    #[default]
    First,
    MaxConfidence,
}

impl AlertSelection {
    pub fn pick<'a>(&self, detections: &'a [Detection]) -> Option<&'a Detection> {
        match self {
            AlertSelection::First => detections.first(),
            AlertSelection::MaxConfidence => detections
                .iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence)),
        }
    }
}

impl std::str::FromStr for AlertSelection {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(AlertSelection::First),
            "max_confidence" | "max-confidence" => Ok(AlertSelection::MaxConfidence),
            other => Err(anyhow::anyhow!(
                "unknown alert selection '{}' (expected first or max_confidence)",
                other
            )),
        }
    }
}
