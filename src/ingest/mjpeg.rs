//! MJPEG input: HTTP camera streams and concatenated-JPEG files.
//!
//! Both read a byte stream and cut it into JPEG images on SOI (`FF D8`) /
//! EOI (`FF D9`) markers, so multipart boundaries and part headers are skipped
//! without being parsed.

use std::fs::File;
use std::io::{BufReader, Read};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use super::file::VideoReader;
use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

/// Live source for HTTP cameras serving MJPEG (or a JPEG per request).
pub struct HttpMjpegSource {
    url: String,
    target_fps: u32,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    frame_count: u64,
    last_error: Option<String>,
}

enum HttpStream {
    Mjpeg(MjpegStream<Box<dyn Read + Send + Sync>>),
    SingleJpeg,
}

impl HttpMjpegSource {
    pub fn new(url: &str, target_fps: u32) -> Self {
        Self {
            url: url.to_string(),
            target_fps,
            stream: None,
            last_frame_at: None,
            connected_at: None,
            frame_count: 0,
            last_error: None,
        }
    }

    fn read_jpeg(&mut self) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("http source not connected; call connect() first"))?;
        match stream {
            HttpStream::Mjpeg(stream) => stream
                .read_next_jpeg()?
                .ok_or_else(|| anyhow!("mjpeg stream ended")),
            HttpStream::SingleJpeg => fetch_single_jpeg(&self.url),
        }
    }
}

impl FrameSource for HttpMjpegSource {
    fn connect(&mut self) -> Result<()> {
        let response = ureq::get(&self.url)
            .call()
            .with_context(|| format!("connect to http stream {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            let reader = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(reader)));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::info!("HttpMjpegSource: connected to {}", self.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let min_interval = frame_interval(self.target_fps);
        loop {
            // Snapshot cameras are polled, so wait out the interval instead of
            // fetching images only to drop them.
            if matches!(self.stream, Some(HttpStream::SingleJpeg)) {
                if let Some(wait) =
                    remaining_interval(self.last_frame_at, min_interval, Instant::now())
                {
                    thread::sleep(wait);
                }
            }
            let jpeg_bytes = self.read_jpeg().map_err(|err| {
                self.last_error = Some(err.to_string());
                err
            })?;

            let now = Instant::now();
            if remaining_interval(self.last_frame_at, min_interval, now).is_some() {
                continue;
            }

            let frame = decode_jpeg(&jpeg_bytes)?;
            self.frame_count += 1;
            self.last_frame_at = Some(now);
            self.last_error = None;
            return Ok(frame);
        }
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
        last_frame_at.elapsed() <= health_grace(self.target_fps)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
        }
    }
}

/// Splits a byte stream into JPEG images.
pub struct MjpegStream<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> MjpegStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG, or `None` once the reader is exhausted.
    pub fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

/// Batch reader for `.mjpeg` files.
pub struct MjpegFileReader {
    path: String,
    stream: MjpegStream<BufReader<File>>,
    total_frames: u64,
}

impl MjpegFileReader {
    pub fn open(path: &str) -> Result<Self> {
        let total_frames = count_jpegs(path)?;
        let file = File::open(path).with_context(|| format!("open mjpeg file {}", path))?;
        log::debug!("MjpegFileReader: {} holds {} frames", path, total_frames);
        Ok(Self {
            path: path.to_string(),
            stream: MjpegStream::new(BufReader::new(file)),
            total_frames,
        })
    }
}

impl VideoReader for MjpegFileReader {
    fn frame_count_hint(&self) -> Option<u64> {
        Some(self.total_frames)
    }

    fn fps(&self) -> Option<f64> {
        None
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.stream.read_next_jpeg()? {
            Some(bytes) => decode_jpeg(&bytes)
                .with_context(|| format!("decode frame from {}", self.path))
                .map(Some),
            None => Ok(None),
        }
    }
}

fn count_jpegs(path: &str) -> Result<u64> {
    let file = File::open(path).with_context(|| format!("open mjpeg file {}", path))?;
    let mut stream = MjpegStream::new(BufReader::new(file));
    let mut count = 0;
    while stream.read_next_jpeg()?.is_some() {
        count += 1;
    }
    Ok(count)
}

fn fetch_single_jpeg(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

/// Decode a JPEG into an RGB frame.
pub fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg")?;
    Ok(Frame::from_rgb_image(image.into_rgb8()))
}

/// Byte range of the first complete JPEG in `buffer`.
pub fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

/// Time left until the next frame is due, if it is not due yet.
fn remaining_interval(
    last_frame_at: Option<Instant>,
    min_interval: Duration,
    now: Instant,
) -> Option<Duration> {
    let due = last_frame_at? + min_interval;
    (due > now).then(|| due - now)
}

fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}
