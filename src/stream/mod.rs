//! Live stream pipelines.
//!
//! Each active stream owns a `PipelineState` (frame buffer, running flag, last
//! detection time) shared by two threads:
//! - capture: source -> `FrameBuffer` (newest frame wins)
//! - inference: `FrameBuffer` -> detector -> detections, alerts, screenshots
//!
//! `StreamSupervisor` is the registry of pipelines keyed by `StreamKey`;
//! `FrameStreamer` turns a pipeline into an annotated MJPEG sequence.

mod capture;
mod inference;
mod key;
mod pipeline;
mod streamer;
mod supervisor;

pub use key::{StreamKey, StreamSource};
pub use pipeline::{PipelineServices, PipelineSettings, PipelineState, RetryPolicy};
pub use streamer::{multipart_part, FrameStreamer, StreamerSettings, MJPEG_BOUNDARY};
pub use supervisor::StreamSupervisor;
