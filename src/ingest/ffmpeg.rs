//! FFmpeg-backed decoding for network streams and container files.
//!
//! One decoder type serves both the live `FrameSource` used for RTSP cameras
//! (feature: rtsp-ffmpeg) and the batch `VideoReader` for local files
//! (feature: ingest-file-ffmpeg). Frames are converted to RGB24 in memory.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use crate::frame::Frame;

struct Decoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_count_hint: Option<u64>,
    fps: Option<f64>,
    draining: bool,
}

impl Decoder {
    fn open(location: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&location)
            .with_context(|| format!("failed to open '{}' with ffmpeg", location))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{}' has no video track", location))?;
        let stream_index = input_stream.index();
        let frame_count_hint = u64::try_from(input_stream.frames()).ok().filter(|n| *n > 0);
        let rate = input_stream.avg_frame_rate();
        let fps = (rate.denominator() != 0 && rate.numerator() > 0)
            .then(|| f64::from(rate.numerator()) / f64::from(rate.denominator()));

        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            frame_count_hint,
            fps,
            draining: false,
        })
    }

    /// Decode the next frame; `None` once the input and decoder are drained.
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                return frame_to_pixels(&rgb_frame).map(Some);
            }
            if self.draining {
                return Ok(None);
            }

            let next_packet = self.input.packets().next();
            match next_packet {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                None => {
                    self.decoder
                        .send_eof()
                        .context("flush ffmpeg decoder")?;
                    self.draining = true;
                }
            }
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<Frame> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0) as usize;
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Frame::new(width, height, packed.to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Frame::new(width, height, pixels)
}

#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) use file_reader::FfmpegFileReader;

#[cfg(feature = "ingest-file-ffmpeg")]
mod file_reader {
    use super::*;
    use crate::ingest::file::VideoReader;

    pub(crate) struct FfmpegFileReader {
        decoder: Decoder,
    }

    impl FfmpegFileReader {
        pub(crate) fn open(path: &str) -> Result<Self> {
            let decoder = Decoder::open(path)?;
            log::info!(
                "FfmpegFileReader: opened {} ({:?} frames)",
                path,
                decoder.frame_count_hint
            );
            Ok(Self { decoder })
        }
    }

    impl VideoReader for FfmpegFileReader {
        fn frame_count_hint(&self) -> Option<u64> {
            self.decoder.frame_count_hint
        }

        fn fps(&self) -> Option<f64> {
            self.decoder.fps
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            self.decoder.next_frame()
        }
    }
}

#[cfg(feature = "rtsp-ffmpeg")]
pub(crate) use stream_source::FfmpegStreamSource;

#[cfg(feature = "rtsp-ffmpeg")]
mod stream_source {
    use super::*;
    use crate::ingest::{FrameSource, SourceStats};
    use std::time::{Duration, Instant};

    pub(crate) struct FfmpegStreamSource {
        url: String,
        decoder: Option<Decoder>,
        frame_count: u64,
        connected_at: Option<Instant>,
        last_frame_at: Option<Instant>,
        last_error: Option<String>,
    }

    impl FfmpegStreamSource {
        pub(crate) fn new(url: &str) -> Self {
            Self {
                url: url.to_string(),
                decoder: None,
                frame_count: 0,
                connected_at: None,
                last_frame_at: None,
                last_error: None,
            }
        }
    }

    impl FrameSource for FfmpegStreamSource {
        fn connect(&mut self) -> Result<()> {
            self.decoder = Some(Decoder::open(&self.url)?);
            self.connected_at = Some(Instant::now());
            self.last_error = None;
            log::info!("FfmpegStreamSource: connected to {}", self.url);
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Frame> {
            let decoder = self
                .decoder
                .as_mut()
                .ok_or_else(|| anyhow!("stream not connected; call connect() first"))?;
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.last_error = Some("stream ended".to_string());
                    return Err(anyhow!("stream {} ended", self.url));
                }
                Err(err) => {
                    self.last_error = Some(err.to_string());
                    return Err(err);
                }
            };
            self.frame_count += 1;
            self.last_frame_at = Some(Instant::now());
            Ok(frame)
        }

        fn is_healthy(&self) -> bool {
            if self.last_error.is_some() {
                return false;
            }
            let Some(connected_at) = self.connected_at else {
                return false;
            };
            let Some(last_frame_at) = self.last_frame_at else {
                return connected_at.elapsed() <= Duration::from_secs(5);
            };
            last_frame_at.elapsed() <= Duration::from_secs(2)
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.frame_count,
                source: self.url.clone(),
            }
        }
    }
}
