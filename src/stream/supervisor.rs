use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::capture::run_capture;
use super::inference::run_inference;
use super::key::{StreamKey, StreamSource};
use super::pipeline::{PipelineServices, PipelineState};
use super::streamer::FrameStreamer;

const JOIN_POLL: Duration = Duration::from_millis(5);

struct Pipeline {
    state: Arc<PipelineState>,
    threads: Vec<JoinHandle<()>>,
}

/// Registry and lifecycle owner of all live stream pipelines.
///
/// At most one pipeline exists per `StreamKey`. `start` and `stop` on the
/// same key are serialised so a key is never half-started while it is being
/// stopped; other keys are not held up by a slow teardown.
pub struct StreamSupervisor {
    services: PipelineServices,
    lifecycles: Mutex<HashMap<StreamKey, Arc<Mutex<()>>>>,
    pipelines: Mutex<HashMap<StreamKey, Pipeline>>,
}

impl StreamSupervisor {
    pub fn new(services: PipelineServices) -> Self {
        Self {
            services,
            lifecycles: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    fn pipelines(&self) -> MutexGuard<'_, HashMap<StreamKey, Pipeline>> {
        self.pipelines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self, key: &StreamKey) -> Arc<Mutex<()>> {
        self.lifecycles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drop the per-key lock once nobody else holds or waits on it.
    fn release_lifecycle(&self, key: &StreamKey, lifecycle: Arc<Mutex<()>>) {
        let mut lifecycles = self.lifecycles.lock().unwrap_or_else(PoisonError::into_inner);
        // One count for the map, one for `lifecycle`.
        if Arc::strong_count(&lifecycle) == 2 {
            lifecycles.remove(key);
        }
    }

    /// Start the pipeline for `source` unless one is already running.
    ///
    /// A registered pipeline that stopped on its own (source failure) is torn
    /// down and replaced with a fresh one.
    pub fn start(&self, source: StreamSource) -> Result<Arc<PipelineState>> {
        let key = source.key();
        let lifecycle = self.lifecycle(&key);
        let _guard = lifecycle.lock().unwrap_or_else(PoisonError::into_inner);

        let stale = {
            let mut pipelines = self.pipelines();
            let existing = pipelines.get(&key).map(|p| p.state.clone());
            match existing {
                Some(state) if state.is_running() => return Ok(state),
                Some(_) => pipelines.remove(&key),
                None => None,
            }
        };
        if let Some(stale) = stale {
            log::info!("stream {}: replacing inactive pipeline", key);
            self.teardown(stale);
        }

        let state = Arc::new(PipelineState::new(key.clone(), source));
        self.services.screenshot_throttle.register(&key);
        let threads = match self.spawn_threads(&state) {
            Ok(threads) => threads,
            Err(err) => {
                self.services.screenshot_throttle.remove(&key);
                return Err(err);
            }
        };

        self.pipelines().insert(
            key.clone(),
            Pipeline {
                state: state.clone(),
                threads,
            },
        );
        log::info!("stream {}: started ({})", key, state.source());
        Ok(state)
    }

    fn spawn_threads(&self, state: &Arc<PipelineState>) -> Result<Vec<JoinHandle<()>>> {
        let settings = &self.services.settings;
        let capture = {
            let state = state.clone();
            let opener = self.services.opener.clone();
            let capture_settings = settings.capture;
            let retry = settings.retry;
            thread::Builder::new()
                .name(format!("capture-{}", state.key()))
                .spawn(move || run_capture(state, opener, capture_settings, retry))
                .context("spawn capture thread")?
        };
        let inference = {
            let state = state.clone();
            let services = self.services.clone();
            thread::Builder::new()
                .name(format!("inference-{}", state.key()))
                .spawn(move || run_inference(state, services))
        };
        match inference {
            Ok(inference) => Ok(vec![capture, inference]),
            Err(err) => {
                state.request_stop();
                join_with_grace(state.key(), vec![capture], settings.stop_grace);
                Err(anyhow::Error::new(err).context("spawn inference thread"))
            }
        }
    }

    /// Stop the pipeline for `key`. Returns `false` if none was registered.
    pub fn stop(&self, key: &StreamKey) -> bool {
        let lifecycle = self.lifecycle(key);
        let stopped = {
            let _guard = lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            let removed = self.pipelines().remove(key);
            match removed {
                Some(pipeline) => {
                    self.teardown(pipeline);
                    log::info!("stream {}: stopped", key);
                    true
                }
                None => false,
            }
        };
        self.release_lifecycle(key, lifecycle);
        stopped
    }

    pub fn stop_all(&self) {
        let keys: Vec<StreamKey> = self.pipelines().keys().cloned().collect();
        for key in keys {
            self.stop(&key);
        }
    }

    fn teardown(&self, pipeline: Pipeline) {
        let key = pipeline.state.key().clone();
        pipeline.state.request_stop();
        join_with_grace(&key, pipeline.threads, self.services.settings.stop_grace);
        self.services.screenshot_throttle.remove(&key);
    }

    pub fn get(&self, key: &StreamKey) -> Option<Arc<PipelineState>> {
        self.pipelines().get(key).map(|p| p.state.clone())
    }

    pub fn is_running(&self, key: &StreamKey) -> bool {
        self.pipelines()
            .get(key)
            .is_some_and(|p| p.state.is_running())
    }

    /// Keys of running pipelines, sorted.
    pub fn active_keys(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self
            .pipelines()
            .values()
            .filter(|p| p.state.is_running())
            .map(|p| p.state.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Running streams whose last detection is at most `window` before `now`.
    pub fn active_streams_with_recent_detection(
        &self,
        window: Duration,
        now: Instant,
    ) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self
            .pipelines()
            .values()
            .filter(|p| p.state.is_running() && p.state.detected_within(window, now))
            .map(|p| p.state.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Viewer entry point: start the pipeline if needed and stream from it.
    pub fn open_stream(&self, source: StreamSource) -> Result<FrameStreamer> {
        let state = self.start(source)?;
        Ok(FrameStreamer::new(
            state,
            self.services.annotator.clone(),
            self.services.streamer,
        ))
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Wait up to `grace` for `threads` to finish. Stragglers are detached; they
/// hold their own `Arc` of the pipeline state and exit at their next check.
fn join_with_grace(key: &StreamKey, threads: Vec<JoinHandle<()>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    for handle in threads {
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                log::error!("stream {}: pipeline thread panicked", key);
            }
        } else {
            log::warn!(
                "stream {}: thread {:?} still busy after {:?}; detaching",
                key,
                handle.thread().name(),
                grace
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertThrottle, LogNotifier};
    use crate::annotate::Annotator;
    use crate::detect::{ClassNames, StubBackend};
    use crate::frame::Frame;
    use crate::ingest::{default_opener, CaptureSettings, FrameSource, SourceOpener, SourceStats};
    use crate::screenshot::ScreenshotThrottle;
    use crate::stream::PipelineSettings;

    fn supervisor() -> StreamSupervisor {
        let services = PipelineServices::new(
            Arc::new(StubBackend::new()),
            Annotator::new(ClassNames::default()),
            Arc::new(AlertThrottle::new(Duration::from_secs(60), Arc::new(LogNotifier))),
            Arc::new(ScreenshotThrottle::new(Duration::from_secs(10))),
        )
        .with_settings(PipelineSettings {
            capture: CaptureSettings {
                width: 16,
                height: 16,
                target_fps: 100,
            },
            idle_wait: Duration::from_millis(10),
            ..PipelineSettings::default()
        });
        StreamSupervisor::new(services)
    }

    #[test]
    fn stop_before_start_and_double_stop_are_noops() {
        let supervisor = supervisor();
        let key = StreamSource::Url("stub://x".into()).key();
        assert!(!supervisor.stop(&key));
        supervisor.start(StreamSource::Url("stub://x".into())).unwrap();
        assert!(supervisor.stop(&key));
        assert!(!supervisor.stop(&key));
        assert!(supervisor.active_keys().is_empty());
    }

    /// Blocks in `next_frame` without checking any stop flag.
    struct StallingSource;

    impl FrameSource for StallingSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Frame> {
            thread::sleep(Duration::from_millis(400));
            Ok(Frame::solid(16, 16, [0, 0, 0]))
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: 0,
                source: "stall".to_string(),
            }
        }
    }

    #[test]
    fn slow_teardown_does_not_block_other_keys() {
        let fallback = default_opener();
        let opener: SourceOpener = Arc::new(
            move |source: &StreamSource, settings: &CaptureSettings| match source {
                StreamSource::Url(url) if url.starts_with("stub://stall") => {
                    Ok(Box::new(StallingSource) as Box<dyn FrameSource>)
                }
                _ => fallback(source, settings),
            },
        );
        let mut supervisor = supervisor();
        supervisor.services = supervisor.services.clone().with_opener(opener);
        let supervisor = Arc::new(supervisor);

        let stalled = supervisor
            .start(StreamSource::Url("stub://stall".into()))
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        let stopper = {
            let supervisor = supervisor.clone();
            let key = stalled.key().clone();
            thread::spawn(move || supervisor.stop(&key))
        };
        while stalled.is_running() {
            thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        let other = supervisor
            .start(StreamSource::Url("stub://other".into()))
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(other.is_running());
        assert!(stopper.join().unwrap());
        supervisor.stop_all();
        assert!(supervisor.lifecycles.lock().unwrap().is_empty());
    }

    #[test]
    fn throttle_entry_follows_pipeline_lifetime() {
        let supervisor = supervisor();
        let source = StreamSource::Url("stub://cam".into());
        let key = source.key();
        supervisor.start(source).unwrap();
        assert!(supervisor.services().screenshot_throttle.is_registered(&key));
        supervisor.stop(&key);
        assert!(!supervisor.services().screenshot_throttle.is_registered(&key));
    }
}
