use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::key::{StreamKey, StreamSource};
use super::streamer::StreamerSettings;
use crate::alert::{AlertSelection, AlertThrottle};
use crate::annotate::Annotator;
use crate::detect::{ClassNames, SharedDetector};
use crate::frame::FrameBuffer;
use crate::ingest::{default_opener, CaptureSettings, SourceOpener};
use crate::screenshot::{ScreenshotStore, ScreenshotThrottle};

/// Shared state of one running stream.
///
/// Threads and viewers hold it through `Arc`, so a stopped pipeline's buffer
/// stays readable until the last holder lets go.
pub struct PipelineState {
    key: StreamKey,
    source: StreamSource,
    buffer: FrameBuffer,
    running: AtomicBool,
    last_detection: Mutex<Option<Instant>>,
}

impl PipelineState {
    pub fn new(key: StreamKey, source: StreamSource) -> Self {
        Self {
            key,
            source,
            buffer: FrameBuffer::new(),
            running: AtomicBool::new(true),
            last_detection: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn source(&self) -> &StreamSource {
        &self.source
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clear the running flag and wake every thread blocked on the buffer.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.buffer.wake_all();
    }

    pub fn mark_detection(&self, at: Instant) {
        *self
            .last_detection
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    pub fn last_detection(&self) -> Option<Instant> {
        *self
            .last_detection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn detected_within(&self, window: Duration, now: Instant) -> bool {
        self.last_detection()
            .is_some_and(|at| now.saturating_duration_since(at) <= window)
    }
}

/// Read-failure handling for capture loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive read failures that end the pipeline. `0` retries forever.
    pub max_consecutive_failures: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_secs(1),
            max_consecutive_failures: 0,
        }
    }
}

/// Tunables shared by every pipeline.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub capture: CaptureSettings,
    pub confidence_threshold: f32,
    /// Run detection on every Nth distinct frame.
    pub detection_skip: u64,
    pub alert_selection: AlertSelection,
    pub retry: RetryPolicy,
    /// Upper bound on how long `stop` waits for the threads to exit.
    pub stop_grace: Duration,
    /// How long a blocked thread waits before re-checking its running flag.
    pub idle_wait: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            confidence_threshold: 0.7,
            detection_skip: 4,
            alert_selection: AlertSelection::First,
            retry: RetryPolicy::default(),
            stop_grace: Duration::from_secs(2),
            idle_wait: Duration::from_millis(100),
        }
    }
}

/// Collaborators handed to every pipeline.
#[derive(Clone)]
pub struct PipelineServices {
    pub detector: SharedDetector,
    pub annotator: Annotator,
    pub alerts: Arc<AlertThrottle>,
    pub screenshot_throttle: Arc<ScreenshotThrottle>,
    /// `None` disables screenshot persistence.
    pub screenshots: Option<Arc<ScreenshotStore>>,
    pub opener: SourceOpener,
    pub settings: PipelineSettings,
    pub streamer: StreamerSettings,
}

impl PipelineServices {
    pub fn new(
        detector: SharedDetector,
        annotator: Annotator,
        alerts: Arc<AlertThrottle>,
        screenshot_throttle: Arc<ScreenshotThrottle>,
    ) -> Self {
        Self {
            detector,
            annotator,
            alerts,
            screenshot_throttle,
            screenshots: None,
            opener: default_opener(),
            settings: PipelineSettings::default(),
            streamer: StreamerSettings::default(),
        }
    }

    pub fn with_screenshots(mut self, store: Arc<ScreenshotStore>) -> Self {
        self.screenshots = Some(store);
        self
    }

    pub fn with_opener(mut self, opener: SourceOpener) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_streamer(mut self, streamer: StreamerSettings) -> Self {
        self.streamer = streamer;
        self
    }

    pub fn class_names(&self) -> &ClassNames {
        self.annotator.class_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_detection_window() {
        let state = PipelineState::new(StreamSource::Device(0).key(), StreamSource::Device(0));
        let t0 = Instant::now();
        assert!(!state.detected_within(Duration::from_secs(10), t0));
        state.mark_detection(t0);
        assert!(state.detected_within(Duration::from_secs(10), t0 + Duration::from_secs(10)));
        assert!(!state.detected_within(Duration::from_secs(10), t0 + Duration::from_secs(11)));
    }

    #[test]
    fn request_stop_clears_running() {
        let state = PipelineState::new(StreamSource::Device(0).key(), StreamSource::Device(0));
        assert!(state.is_running());
        state.request_stop();
        assert!(!state.is_running());
    }
}
