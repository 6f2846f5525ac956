use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::pipeline::PipelineState;
use crate::annotate::Annotator;

/// Multipart boundary used for MJPEG responses.
pub const MJPEG_BOUNDARY: &str = "frame";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamerSettings {
    /// Minimum spacing between emitted frames.
    pub poll_interval: Duration,
    pub jpeg_quality: u8,
    /// Longest a viewer blocks before re-checking the running flag.
    pub idle_wait: Duration,
}

impl Default for StreamerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            jpeg_quality: 90,
            idle_wait: Duration::from_millis(100),
        }
    }
}

/// Annotated JPEG sequence for one viewer of a stream.
///
/// Each item is the newest frame with the newest detections drawn over it. The
/// sequence ends once the pipeline stops; dropping the streamer is all a
/// disconnecting viewer needs to do.
pub struct FrameStreamer {
    state: Arc<PipelineState>,
    annotator: Annotator,
    settings: StreamerSettings,
    seen_generation: u64,
    last_emit: Option<Instant>,
}

impl FrameStreamer {
    pub fn new(state: Arc<PipelineState>, annotator: Annotator, settings: StreamerSettings) -> Self {
        Self {
            state,
            annotator,
            settings,
            seen_generation: 0,
            last_emit: None,
        }
    }

    pub fn state(&self) -> &Arc<PipelineState> {
        &self.state
    }

    /// Block until the buffer changes and return the annotated frame, or
    /// `None` once the pipeline is no longer running.
    pub fn next_jpeg(&mut self) -> Option<Vec<u8>> {
        loop {
            if !self.state.is_running() {
                return None;
            }
            let snapshot = self
                .state
                .buffer()
                .wait_for_change(self.seen_generation, self.settings.idle_wait);
            if snapshot.generation == self.seen_generation {
                continue;
            }
            self.seen_generation = snapshot.generation;
            let Some(frame) = snapshot.frame else {
                continue;
            };

            self.pace();
            match self.annotator.annotate_jpeg(
                &frame,
                &snapshot.detections,
                self.settings.jpeg_quality,
            ) {
                Ok(jpeg) => return Some(jpeg),
                Err(err) => {
                    log::warn!("streamer {}: encode failed: {:#}", self.state.key(), err);
                }
            }
        }
    }

    /// Next frame wrapped as a multipart part.
    pub fn next_part(&mut self) -> Option<Vec<u8>> {
        self.next_jpeg().map(|jpeg| multipart_part(&jpeg))
    }

    fn pace(&mut self) {
        if let Some(last) = self.last_emit {
            let elapsed = last.elapsed();
            if elapsed < self.settings.poll_interval {
                thread::sleep(self.settings.poll_interval - elapsed);
            }
        }
        self.last_emit = Some(Instant::now());
    }
}

impl Iterator for FrameStreamer {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_part()
    }
}

/// `--frame` part header, JPEG body, trailing CRLF.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}
