use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::annotate::encode_jpeg;
use crate::frame::Frame;

/// Destination for annotated batch frames.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close the output.
    fn finish(&mut self) -> Result<()>;
}

/// Writes frames as concatenated JPEGs (`.mjpeg`), readable by the batch
/// reader and by most players.
pub struct MjpegFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    quality: u8,
    frames_written: u64,
}

impl MjpegFileSink {
    pub fn create(path: impl AsRef<Path>, quality: u8) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("create output {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            quality,
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl FrameSink for MjpegFileSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let jpeg = encode_jpeg(&frame.to_rgb_image(), self.quality)?;
        self.writer
            .write_all(&jpeg)
            .with_context(|| format!("write frame to {}", self.path.display()))?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))
    }
}
