use anyhow::Result;
use std::sync::Arc;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// Backends are called concurrently from every stream's inference thread and
/// from batch jobs, so `detect` takes `&self`. Implementations with mutable
/// state must synchronise it internally.
///
/// Returned detections are unfiltered; callers apply the configured
/// confidence threshold with [`crate::detect::filter_by_confidence`].
pub trait DetectorBackend: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Coordinates are in frame pixels.
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

pub type SharedDetector = Arc<dyn DetectorBackend>;
