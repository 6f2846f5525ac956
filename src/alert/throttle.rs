use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::notify::Notifier;
use super::Alert;

/// Result of offering an alert to the throttle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertOutcome {
    Sent,
    /// Delivery was attempted and failed. The window is still consumed.
    Failed,
    /// Inside the cooldown window; nothing was attempted.
    Suppressed,
}

/// Global alert rate limiter shared by every stream.
///
/// The window check and the window update happen under one lock, so two
/// streams racing for the same window cannot both win. Delivery happens after
/// the lock is released.
pub struct AlertThrottle {
    cooldown: Duration,
    last_alert: Mutex<Option<Instant>>,
    notifier: Arc<dyn Notifier>,
}

impl AlertThrottle {
    pub fn new(cooldown: Duration, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            cooldown,
            last_alert: Mutex::new(None),
            notifier,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn try_alert(&self, alert: &Alert, now: Instant) -> AlertOutcome {
        {
            let mut last = self.last_alert.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                if now.saturating_duration_since(previous) < self.cooldown {
                    log::debug!(
                        "alert for {} suppressed (cooldown {:?})",
                        alert.stream,
                        self.cooldown
                    );
                    return AlertOutcome::Suppressed;
                }
            }
            *last = Some(now);
        }

        match self.notifier.send(alert) {
            Ok(()) => {
                log::info!(
                    "alert sent via {}: {} {:.2} on {}",
                    self.notifier.name(),
                    alert.label,
                    alert.confidence,
                    alert.stream
                );
                AlertOutcome::Sent
            }
            Err(err) => {
                log::error!("failed to send alert via {}: {:#}", self.notifier.name(), err);
                AlertOutcome::Failed
            }
        }
    }
}
