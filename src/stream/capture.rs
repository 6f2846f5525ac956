use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::pipeline::{PipelineState, RetryPolicy};
use super::StreamKey;
use crate::ingest::{CaptureSettings, FrameSource, SourceOpener};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Capture loop for one stream.
///
/// Open or connect failure ends the pipeline. Read failures are retried with
/// exponential backoff, reset after every good frame, until the running flag
/// clears or `max_consecutive_failures` is reached. A source that reports
/// itself unhealthy after a failed read is reconnected before the next retry.
pub(crate) fn run_capture(
    state: Arc<PipelineState>,
    opener: SourceOpener,
    settings: CaptureSettings,
    retry: RetryPolicy,
) {
    let key = state.key().clone();
    let mut source = match open_and_connect(&state, &opener, &settings) {
        Ok(source) => source,
        Err(err) => {
            log::error!("capture {}: cannot open {}: {:#}", key, state.source(), err);
            state.request_stop();
            return;
        }
    };
    log::info!("capture {}: started", key);

    let mut failures: u32 = 0;
    let mut backoff = retry.initial_backoff;
    while state.is_running() {
        match source.next_frame() {
            Ok(frame) => {
                state.buffer().put_frame(frame);
                if failures > 0 {
                    log::info!("capture {}: recovered after {} failed reads", key, failures);
                }
                failures = 0;
                backoff = retry.initial_backoff;
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                if failures.is_power_of_two() {
                    log::warn!("capture {}: read failed ({} in a row): {:#}", key, failures, err);
                } else {
                    log::debug!("capture {}: read failed: {:#}", key, err);
                }
                if retry.max_consecutive_failures > 0 && failures >= retry.max_consecutive_failures
                {
                    log::error!(
                        "capture {}: giving up after {} consecutive read failures",
                        key,
                        failures
                    );
                    state.request_stop();
                    break;
                }
                sleep_while_running(&state, backoff);
                backoff = (backoff * 2).min(retry.max_backoff);
                if state.is_running() && !source.is_healthy() {
                    reconnect(&key, source.as_mut());
                }
            }
        }
    }

    log::info!(
        "capture {}: stopped ({} frames captured)",
        key,
        source.stats().frames_captured
    );
}

fn open_and_connect(
    state: &PipelineState,
    opener: &SourceOpener,
    settings: &CaptureSettings,
) -> anyhow::Result<Box<dyn FrameSource>> {
    let mut source = opener(state.source(), settings)?;
    source.connect()?;
    Ok(source)
}

fn reconnect(key: &StreamKey, source: &mut dyn FrameSource) {
    match source.connect() {
        Ok(()) => log::info!("capture {}: reconnected unhealthy source", key),
        Err(err) => log::debug!("capture {}: reconnect failed: {:#}", key, err),
    }
}

/// Sleep for `duration`, returning early once the pipeline stops.
fn sleep_while_running(state: &PipelineState, duration: Duration) {
    let deadline = Instant::now() + duration;
    while state.is_running() {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
