use std::sync::Arc;
use std::time::Instant;

use chrono::Local;

use super::pipeline::{PipelineServices, PipelineState};
use crate::alert::Alert;
use crate::detect::{filter_by_confidence, Detection};
use crate::frame::Frame;

/// Inference loop for one stream.
///
/// Blocks on the buffer for new frames and runs the detector on every Nth
/// distinct frame it observes, starting with the first. Frames written while
/// the detector is busy are skipped, not queued.
pub(crate) fn run_inference(state: Arc<PipelineState>, services: PipelineServices) {
    let key = state.key().clone();
    let settings = &services.settings;
    let skip = settings.detection_skip.max(1);
    let mut seen_seq = 0;
    let mut observed: u64 = 0;

    log::info!("inference {}: started (every {} frames)", key, skip);
    while state.is_running() {
        let Some((seq, frame)) = state.buffer().wait_for_frame(seen_seq, settings.idle_wait)
        else {
            continue;
        };
        seen_seq = seq;
        let sampled = observed % skip == 0;
        observed += 1;
        if !sampled {
            continue;
        }

        let detections = match services.detector.detect(&frame) {
            Ok(raw) => filter_by_confidence(raw, settings.confidence_threshold),
            Err(err) => {
                log::warn!("inference {}: detector error: {:#}", key, err);
                Vec::new()
            }
        };
        state.buffer().set_detections(detections.clone());

        if !detections.is_empty() {
            log::debug!("inference {}: {} detections", key, detections.len());
            on_detections(&state, &services, &frame, &detections);
        }
    }
    log::info!("inference {}: stopped after {} frames", key, observed);
}

/// Side effects of a non-empty detection result: liveness, alert, screenshot.
fn on_detections(
    state: &PipelineState,
    services: &PipelineServices,
    frame: &Frame,
    detections: &[Detection],
) {
    let now = Instant::now();
    state.mark_detection(now);

    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    if let Some(alert) = Alert::from_detections(
        state.key(),
        detections,
        services.class_names(),
        services.settings.alert_selection,
        timestamp,
    ) {
        services.alerts.try_alert(&alert, now);
    }

    if !services.screenshot_throttle.try_capture(state.key(), now) {
        return;
    }
    if let Some(store) = &services.screenshots {
        if let Err(err) = store.save(state.key(), frame, detections, Local::now()) {
            log::warn!("inference {}: screenshot failed: {:#}", state.key(), err);
        }
    }
}
