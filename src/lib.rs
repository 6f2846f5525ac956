//! gunwatch - multi-stream weapon detection pipeline
//!
//! This crate runs an object detector against live camera streams and uploaded
//! video files, and surfaces annotated output, alerts and screenshot history.
//!
//! # Architecture
//!
//! Per stream, two threads communicate only through a single-slot frame buffer:
//!
//! 1. **Capture** pulls frames from the source; the newest frame always wins.
//! 2. **Inference** samples every Nth new frame, runs the detector, writes the
//!    filtered detections back and fires alert / screenshot side effects.
//!
//! Viewers read snapshots of the same buffer and receive an annotated MJPEG
//! stream. Uploaded files go through the batch processor, which reports
//! percent-complete to a progress store.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` raster and the single-slot `FrameBuffer`
//! - `detect`: detector backends, detections, confidence filtering
//! - `ingest`: live frame sources and video file readers
//! - `stream`: stream identity, capture/inference loops, supervisor, streamer
//! - `annotate`: box and label overlay, JPEG encoding
//! - `alert` / `screenshot`: throttled side effects of a detection
//! - `batch`: file processing and progress reporting
//! - `api`: HTTP endpoints for viewers, uploads and status queries

pub mod alert;
pub mod annotate;
pub mod api;
pub mod batch;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod screenshot;
pub mod stream;

pub use alert::{
    Alert, AlertOutcome, AlertSelection, AlertThrottle, FanoutNotifier, LogNotifier,
    MqttNotifier, Notifier, WebhookNotifier,
};
pub use annotate::{encode_jpeg, Annotator};
pub use api::{ApiConfig, ApiHandle, ApiServer, ApiState};
pub use batch::{
    BatchJob, BatchProcessor, FrameSink, JobId, MjpegFileSink, ProgressStore,
};
pub use config::GunwatchConfig;
pub use detect::{
    build_detector, filter_by_confidence, BackendRegistry, BoundingBox, ClassNames, Detection, DetectorBackend,
    SharedDetector, StubBackend,
};
pub use frame::{Frame, FrameBuffer, FrameSnapshot};
pub use ingest::{open_source, open_video, CaptureSettings, FrameSource, VideoReader};
pub use screenshot::{ScreenshotEntry, ScreenshotStore, ScreenshotThrottle};
pub use stream::{
    FrameStreamer, PipelineServices, PipelineSettings, PipelineState, StreamKey, StreamSource,
    StreamSupervisor, StreamerSettings,
};
