use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub backend. Returns the same detections for every frame (none by default).
#[derive(Default)]
pub struct StubBackend {
    detections: Vec<Detection>,
    calls: AtomicU64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of `detect` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.detections.clone())
    }
}

/// Scripted backend for tests. Plays back queued outcomes in order, then keeps
/// returning the fallback.
pub struct SequenceBackend {
    script: Mutex<VecDeque<std::result::Result<Vec<Detection>, String>>>,
    fallback: Vec<Detection>,
    calls: AtomicU64,
}

impl SequenceBackend {
    pub fn new(fallback: Vec<Detection>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU64::new(0),
        }
    }

    pub fn then_detections(self, detections: Vec<Detection>) -> Self {
        self.push(Ok(detections));
        self
    }

    pub fn then_error(self, message: &str) -> Self {
        self.push(Err(message.to_string()));
        self
    }

    fn push(&self, outcome: std::result::Result<Vec<Detection>, String>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DetectorBackend for SequenceBackend {
    fn name(&self) -> &'static str {
        "sequence"
    }

    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(Ok(detections)) => Ok(detections),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(self.fallback.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn sequence_backend_plays_script_then_fallback() {
        let hit = Detection::new(BoundingBox::new(1, 1, 5, 5), 0.9, 0);
        let backend = SequenceBackend::new(Vec::new())
            .then_error("model crashed")
            .then_detections(vec![hit.clone()]);
        let frame = Frame::solid(8, 8, [0, 0, 0]);

        assert!(backend.detect(&frame).is_err());
        assert_eq!(backend.detect(&frame).unwrap(), vec![hit]);
        assert!(backend.detect(&frame).unwrap().is_empty());
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn stub_backend_counts_calls() {
        let backend = StubBackend::new();
        let frame = Frame::solid(2, 2, [0, 0, 0]);
        assert!(backend.detect(&frame).unwrap().is_empty());
        assert_eq!(backend.calls(), 1);
    }
}
