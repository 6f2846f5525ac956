//! V4L2 capture for local camera devices (`/dev/video<n>`).
//!
//! The device is asked for packed RGB24 at the configured size and rate. Cameras
//! that only offer MJPG are accepted and their frames decoded in memory.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::mjpeg::decode_jpeg;
use super::{CaptureSettings, FrameSource, SourceStats};
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeviceFormat {
    Rgb24,
    Mjpeg,
}

pub struct V4l2Source {
    device: String,
    settings: CaptureSettings,
    state: Option<V4l2State>,
    format: DeviceFormat,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(device: String, settings: &CaptureSettings) -> Self {
        Self {
            device,
            settings: *settings,
            state: None,
            format: DeviceFormat::Rgb24,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
            active_width: settings.width,
            active_height: settings.height,
        }
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.settings.target_fps == 0 {
            2_000
        } else {
            (1000 / self.settings.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.device)
            .with_context(|| format!("open v4l2 device {}", self.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.settings.width;
        format.height = self.settings.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.format = if format.fourcc == v4l::FourCC::new(b"RGB3") {
            DeviceFormat::Rgb24
        } else if format.fourcc == v4l::FourCC::new(b"MJPG") {
            DeviceFormat::Mjpeg
        } else {
            return Err(anyhow!(
                "v4l2 device {} offers unsupported pixel format {}",
                self.device,
                format.fourcc
            ));
        };

        if self.settings.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.settings.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", self.device, err);
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.last_error = None;

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{}, {:?})",
            self.device,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let format = self.format;
        let (width, height) = (self.active_width, self.active_height);
        let frame = state
            .with_stream_mut(|stream| -> Result<Frame> {
                let (buf, meta) = stream.next().context("capture v4l2 frame")?;
                let used = (meta.bytesused as usize).min(buf.len());
                match format {
                    DeviceFormat::Rgb24 => {
                        let expected = width as usize * height as usize * 3;
                        let pixels = buf
                            .get(..expected)
                            .ok_or_else(|| anyhow!("short v4l2 buffer ({} bytes)", buf.len()))?;
                        Frame::new(width, height, pixels.to_vec())
                    }
                    DeviceFormat::Mjpeg => decode_jpeg(&buf[..used]),
                }
            })
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                err
            })?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(frame)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return self.state.is_some();
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.device.clone(),
        }
    }
}
