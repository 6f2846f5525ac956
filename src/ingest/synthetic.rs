//! Synthetic `stub://` sources for tests and demos.
//!
//! Frames show a bright square sweeping across a dark background, so the
//! annotated output of a pipeline is visibly alive. Behaviour can be shaped
//! through query parameters:
//!
//! | parameter      | effect                                                 |
//! |----------------|--------------------------------------------------------|
//! | `width`/`height` | frame size (defaults to the capture settings)        |
//! | `fps`          | pacing; `0` produces frames as fast as they are read   |
//! | `frames`       | number of frames before the source ends                |
//! | `count_hint`   | clip frame-count hint; `0` reports it as unknown       |
//! | `fail_connect` | `connect` fails                                        |
//! | `fail_reads`   | the first N reads fail                                 |
//! | `drop_after`   | the connection drops once after N frames               |

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use url::Url;

use super::file::VideoReader;
use super::{CaptureSettings, FrameSource, SourceStats};
use crate::frame::Frame;

const BACKGROUND: [u8; 3] = [24, 24, 32];
const DEFAULT_CLIP_FRAMES: u64 = 10;
const DEFAULT_CLIP_SIZE: (u32, u32) = (320, 240);

#[derive(Clone, Debug)]
struct SyntheticOptions {
    width: u32,
    height: u32,
    fps: u32,
    frames: Option<u64>,
    count_hint: Option<u64>,
    fail_connect: bool,
    fail_reads: u64,
    drop_after: Option<u64>,
}

impl SyntheticOptions {
    fn parse(url: &str, width: u32, height: u32, fps: u32) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("parse synthetic url '{}'", url))?;
        if parsed.scheme() != "stub" {
            bail!("synthetic sources use the stub:// scheme, got '{}'", url);
        }
        let mut options = Self {
            width,
            height,
            fps,
            frames: None,
            count_hint: None,
            fail_connect: false,
            fail_reads: 0,
            drop_after: None,
        };
        for (name, value) in parsed.query_pairs() {
            let number = || -> Result<u64> {
                value
                    .parse::<u64>()
                    .with_context(|| format!("synthetic option {}='{}'", name, value))
            };
            match name.as_ref() {
                "width" => options.width = number()? as u32,
                "height" => options.height = number()? as u32,
                "fps" => options.fps = number()? as u32,
                "frames" => options.frames = Some(number()?),
                "count_hint" => options.count_hint = Some(number()?),
                "fail_connect" => options.fail_connect = value != "0" && value != "false",
                "fail_reads" => options.fail_reads = number()?,
                "drop_after" => options.drop_after = Some(number()?),
                other => log::debug!("synthetic source: ignoring option '{}'", other),
            }
        }
        if options.width == 0 || options.height == 0 {
            bail!("synthetic frame size must be non-zero");
        }
        Ok(options)
    }
}

/// Draw frame `index` of the sweeping-square scene.
fn render(width: u32, height: u32, index: u64) -> Frame {
    let mut frame = Frame::solid(width, height, BACKGROUND).to_rgb_image();
    let side = (width.min(height) / 4).max(1);
    let travel = (width - side).max(1) as u64;
    let x0 = (index * 4 % travel) as u32;
    let y0 = (height - side) / 2;
    let shade = 160 + (index % 96) as u8;
    for y in y0..y0 + side {
        for x in x0..x0 + side {
            frame.put_pixel(x, y, image::Rgb([shade, shade, 255]));
        }
    }
    Frame::from_rgb_image(frame)
}

/// Live synthetic source.
pub struct SyntheticSource {
    url: String,
    options: SyntheticOptions,
    connected: bool,
    frame_count: u64,
    failed_reads: u64,
    dropped: bool,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(url: &str, settings: &CaptureSettings) -> Result<Self> {
        let options =
            SyntheticOptions::parse(url, settings.width, settings.height, settings.target_fps)?;
        Ok(Self {
            url: url.to_string(),
            options,
            connected: false,
            frame_count: 0,
            failed_reads: 0,
            dropped: false,
            next_due: None,
        })
    }

    fn pace(&mut self) {
        if self.options.fps == 0 {
            return;
        }
        let interval = Duration::from_micros(1_000_000 / self.options.fps as u64);
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.next_due = Some(self.next_due.unwrap_or(now).max(now) + interval);
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        if self.options.fail_connect {
            bail!("synthetic source {} refused connection", self.url);
        }
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            bail!("synthetic source not connected; call connect() first");
        }
        if self.failed_reads < self.options.fail_reads {
            self.failed_reads += 1;
            bail!("synthetic read failure {}", self.failed_reads);
        }
        if let Some(limit) = self.options.frames {
            if self.frame_count >= limit {
                return Err(anyhow!("synthetic stream {} ended", self.url));
            }
        }
        if self.options.drop_after == Some(self.frame_count) && !self.dropped {
            self.dropped = true;
            self.connected = false;
            bail!("synthetic source {} dropped the connection", self.url);
        }
        self.pace();
        let frame = render(self.options.width, self.options.height, self.frame_count);
        self.frame_count += 1;
        Ok(frame)
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
        }
    }
}

/// Finite synthetic clip for batch processing, e.g. `stub://clip?frames=10`.
pub struct SyntheticClip {
    options: SyntheticOptions,
    produced: u64,
    total: u64,
}

impl SyntheticClip {
    pub fn open(url: &str) -> Result<Self> {
        let (width, height) = DEFAULT_CLIP_SIZE;
        let options = SyntheticOptions::parse(url, width, height, 30)?;
        if options.fail_connect {
            bail!("synthetic clip {} could not be opened", url);
        }
        let total = options.frames.unwrap_or(DEFAULT_CLIP_FRAMES);
        Ok(Self {
            options,
            produced: 0,
            total,
        })
    }
}

impl VideoReader for SyntheticClip {
    fn frame_count_hint(&self) -> Option<u64> {
        match self.options.count_hint {
            Some(0) => None,
            Some(hint) => Some(hint),
            None => Some(self.total),
        }
    }

    fn fps(&self) -> Option<f64> {
        Some(self.options.fps as f64).filter(|fps| *fps > 0.0)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.produced >= self.total {
            return Ok(None);
        }
        if self.produced < self.options.fail_reads {
            self.produced += 1;
            bail!("synthetic clip read failure at frame {}", self.produced);
        }
        let frame = render(self.options.width, self.options.height, self.produced);
        self.produced += 1;
        Ok(Some(frame))
    }
}
