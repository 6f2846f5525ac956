//! Video file input for batch processing.
//!
//! `open_video` picks a reader by path:
//! - `stub://...` synthetic clips (testing)
//! - `.mjpeg` / `.mjpg` concatenated-JPEG files
//! - anything else through FFmpeg (feature: ingest-file-ffmpeg)
//!
//! Readers only read local files; URLs other than `stub://` are rejected.

use std::path::Path;

use anyhow::{anyhow, Result};

use super::mjpeg::MjpegFileReader;
use super::synthetic::SyntheticClip;
use crate::frame::Frame;

/// Sequential reader over a finite video.
pub trait VideoReader: Send {
    /// Frame count reported by the container, if known. May be an estimate.
    fn frame_count_hint(&self) -> Option<u64>;

    fn fps(&self) -> Option<f64>;

    /// Next decoded frame, or `None` at end of input.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Open `path` with the reader matching its kind.
pub fn open_video(path: &str) -> Result<Box<dyn VideoReader>> {
    if path.trim().is_empty() {
        return Err(anyhow!("video path is empty"));
    }
    if path.starts_with("stub://") {
        return Ok(Box::new(SyntheticClip::open(path)?));
    }
    if path.contains("://") {
        return Err(anyhow!(
            "video input only supports local paths (no URL schemes)"
        ));
    }

    let extension = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("mjpeg") | Some("mjpg") => Ok(Box::new(MjpegFileReader::open(path)?)),
        _ => open_container(path),
    }
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_container(path: &str) -> Result<Box<dyn VideoReader>> {
    Ok(Box::new(super::ffmpeg::FfmpegFileReader::open(path)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_container(path: &str) -> Result<Box<dyn VideoReader>> {
    Err(anyhow!(
        "decoding '{}' requires the ingest-file-ffmpeg feature",
        path
    ))
}
