use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;

use super::job::{BatchJob, JobId};
use super::progress::{percent, ProgressStore};
use super::sink::{FrameSink, MjpegFileSink};
use crate::annotate::Annotator;
use crate::detect::{filter_by_confidence, SharedDetector};
use crate::ingest::{open_video, VideoReader};

/// Summary of a finished job.
#[derive(Clone, Debug, Serialize)]
pub struct BatchReport {
    pub job_id: JobId,
    pub frames_processed: u64,
    pub frames_with_detections: u64,
    pub write_failures: u64,
    pub output_path: PathBuf,
}

/// Runs whole files through detection and annotation, one job per call.
pub struct BatchProcessor {
    detector: SharedDetector,
    annotator: Annotator,
    threshold: f32,
    quality: u8,
    progress: Arc<ProgressStore>,
    progress_grace: Duration,
}

impl BatchProcessor {
    pub fn new(
        detector: SharedDetector,
        annotator: Annotator,
        threshold: f32,
        progress: Arc<ProgressStore>,
    ) -> Self {
        Self {
            detector,
            annotator,
            threshold,
            quality: 90,
            progress,
            progress_grace: Duration::from_millis(500),
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// How long the final 100 stays readable before the record is cleared.
    pub fn with_progress_grace(mut self, grace: Duration) -> Self {
        self.progress_grace = grace;
        self
    }

    pub fn progress(&self) -> &Arc<ProgressStore> {
        &self.progress
    }

    /// Process `input` into an MJPEG file at `output`.
    ///
    /// An input that cannot be opened still completes the progress record, so
    /// pollers see 100 and the record is cleared.
    pub fn process_file(&self, id: JobId, input: &Path, output: &Path) -> Result<BatchReport> {
        let opened = input
            .to_str()
            .ok_or_else(|| anyhow!("input path is not valid UTF-8: {}", input.display()))
            .and_then(open_video)
            .and_then(|reader| Ok((reader, MjpegFileSink::create(output, self.quality)?)));
        let (mut reader, mut sink) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                log::error!("job {}: cannot open {}: {:#}", id, input.display(), err);
                self.complete(&id);
                return Err(err);
            }
        };
        log::debug!("job {}: writing {}", id, sink.path().display());
        let mut job = BatchJob::new(id, input.to_path_buf(), output.to_path_buf());
        self.process(&mut job, reader.as_mut(), &mut sink)
    }

    pub fn process(
        &self,
        job: &mut BatchJob,
        reader: &mut dyn VideoReader,
        sink: &mut dyn FrameSink,
    ) -> Result<BatchReport> {
        self.process_with(job, reader, sink, &mut |_| {})
    }

    /// Like `process`, calling `observer` with every published percent.
    ///
    /// A read error stops the job: frames written so far are kept, 100 is
    /// published and the call returns `Err`.
    pub fn process_with(
        &self,
        job: &mut BatchJob,
        reader: &mut dyn VideoReader,
        sink: &mut dyn FrameSink,
        observer: &mut dyn FnMut(u8),
    ) -> Result<BatchReport> {
        job.total_frames = reader.frame_count_hint().unwrap_or(0);
        job.processed_frames = 0;
        log::info!(
            "job {}: processing {} ({} frames expected)",
            job.id,
            job.input_path.display(),
            job.total_frames
        );

        let id = job.id.clone();
        let mut publish = |value: u8| {
            self.progress.publish(&id, value);
            observer(value);
        };
        publish(0);

        let mut frames_with_detections = 0;
        let mut write_failures = 0;
        let mut read_error = None;
        loop {
            let frame = match reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    log::error!(
                        "job {}: read failed after {} frames: {:#}",
                        job.id,
                        job.processed_frames,
                        err
                    );
                    read_error = Some(err);
                    break;
                }
            };
            let detections = match self.detector.detect(&frame) {
                Ok(raw) => filter_by_confidence(raw, self.threshold),
                Err(err) => {
                    log::warn!("job {}: detector error: {:#}", job.id, err);
                    Vec::new()
                }
            };
            if !detections.is_empty() {
                frames_with_detections += 1;
            }

            let annotated = self.annotator.annotate_frame(&frame, &detections);
            if let Err(err) = sink.write_frame(&annotated) {
                write_failures += 1;
                log::warn!("job {}: frame write failed: {:#}", job.id, err);
            }

            job.processed_frames += 1;
            publish(percent(job.processed_frames, job.total_frames));
        }

        if let Err(err) = sink.finish() {
            write_failures += 1;
            log::error!("job {}: finalizing output failed: {:#}", job.id, err);
        }

        publish(100);
        self.complete(&job.id);
        if let Some(err) = read_error {
            return Err(err.context(format!("job {} stopped early", job.id)));
        }
        log::info!(
            "job {}: finished {} frames ({} with detections) -> {}",
            job.id,
            job.processed_frames,
            frames_with_detections,
            job.output_path.display()
        );

        Ok(BatchReport {
            job_id: job.id.clone(),
            frames_processed: job.processed_frames,
            frames_with_detections,
            write_failures,
            output_path: job.output_path.clone(),
        })
    }

    /// Publish 100, keep it readable for the grace period, then drop the record.
    fn complete(&self, id: &JobId) {
        self.progress.publish(id, 100);
        thread::sleep(self.progress_grace);
        self.progress.clear(id);
    }
}
