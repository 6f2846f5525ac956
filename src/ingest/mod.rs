//! Frame ingestion.
//!
//! Two kinds of input feed the pipeline:
//! - `FrameSource`: live sources read continuously by a stream's capture loop
//! - `VideoReader`: finite video files read front to back by the batch processor
//!
//! Live sources:
//! - `stub://` synthetic scenes (testing, demos)
//! - HTTP(S) MJPEG streams, or single JPEG snapshots polled repeatedly
//! - RTSP and other network URLs (feature: rtsp-ffmpeg)
//! - Local V4L2 devices by index (feature: ingest-v4l2)
//!
//! Sources never write frames to disk; frames are handed to the stream's
//! `FrameBuffer` and dropped when overwritten.

#[cfg(any(feature = "rtsp-ffmpeg", feature = "ingest-file-ffmpeg"))]
mod ffmpeg;
pub mod file;
pub mod mjpeg;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::sync::Arc;

use anyhow::Result;

use crate::frame::Frame;
use crate::stream::StreamSource;

pub use file::{open_video, VideoReader};
pub use mjpeg::{decode_jpeg, find_jpeg_bounds, HttpMjpegSource, MjpegFileReader};
pub use synthetic::{SyntheticClip, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// A live source of frames.
pub trait FrameSource: Send {
    /// Open the underlying device or connection.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Counters reported by a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Requested capture geometry. Sources treat it as a hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            target_fps: 30,
        }
    }
}

/// Factory used by the supervisor to build a source for a stream.
pub type SourceOpener =
    Arc<dyn Fn(&StreamSource, &CaptureSettings) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// The default opener, dispatching on the source kind.
pub fn default_opener() -> SourceOpener {
    Arc::new(open_source)
}

/// Build an unconnected source for `source`.
pub fn open_source(
    source: &StreamSource,
    settings: &CaptureSettings,
) -> Result<Box<dyn FrameSource>> {
    match source {
        StreamSource::Url(url) if url.starts_with("stub://") => {
            Ok(Box::new(SyntheticSource::new(url, settings)?))
        }
        StreamSource::Url(url) if url.starts_with("http://") || url.starts_with("https://") => {
            Ok(Box::new(HttpMjpegSource::new(url, settings.target_fps)))
        }
        StreamSource::Url(url) => open_network(url),
        StreamSource::Device(index) => open_device(*index, settings),
    }
}

#[cfg(feature = "rtsp-ffmpeg")]
fn open_network(url: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(ffmpeg::FfmpegStreamSource::new(url)))
}

#[cfg(not(feature = "rtsp-ffmpeg"))]
fn open_network(url: &str) -> Result<Box<dyn FrameSource>> {
    Err(anyhow::anyhow!(
        "stream url '{}' requires the rtsp-ffmpeg feature",
        url
    ))
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(index: u32, settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(V4l2Source::new(
        format!("/dev/video{}", index),
        settings,
    )))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(index: u32, _settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow::anyhow!(
        "camera index {} requires the ingest-v4l2 feature",
        index
    ))
}
