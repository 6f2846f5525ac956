//! Batch processing of uploaded video files.
//!
//! A job reads its input front to back, runs detection on every frame, writes
//! the annotated frames to an output sink and publishes percent-complete to the
//! shared `ProgressStore` after each frame.

mod job;
mod processor;
mod progress;
mod sink;

pub use job::{BatchJob, JobId};
pub use processor::{BatchProcessor, BatchReport};
pub use progress::{percent, ProgressStore};
pub use sink::{FrameSink, MjpegFileSink};
