//! Frames and the single-slot frame buffer.
//!
//! - `Frame`: RGB24 raster produced by a source or video reader.
//! - `FrameBuffer`: holds the most recent frame and the most recent detection
//!   result for one stream. Writers replace the slot; readers take snapshots.
//!
//! The buffer never queues. A frame that was not observed before the next
//! write is discarded, so consumers always work on the newest capture.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::detect::Detection;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// In-memory RGB24 image.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap packed RGB24 pixels. The buffer length must match the dimensions.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Frame filled with a single colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.into_raw(),
        }
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        // Length is validated at construction.
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// Consistent copy of a buffer's contents taken under its lock.
///
/// `frame` and `detections` are immutable once published, so sharing them
/// through `Arc` gives readers the same guarantees as a deep copy.
#[derive(Clone, Debug, Default)]
pub struct FrameSnapshot {
    pub frame: Option<Arc<Frame>>,
    pub detections: Arc<Vec<Detection>>,
    /// Bumped on every write (frame or detections).
    pub generation: u64,
    /// Bumped on every frame write only.
    pub frame_seq: u64,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Arc<Frame>>,
    detections: Arc<Vec<Detection>>,
    generation: u64,
    frame_seq: u64,
}

impl SlotState {
    fn snapshot(&self) -> FrameSnapshot {
        FrameSnapshot {
            frame: self.frame.clone(),
            detections: self.detections.clone(),
            generation: self.generation,
            frame_seq: self.frame_seq,
        }
    }
}

/// Single-slot, overwritten buffer for one stream.
///
/// Critical sections only swap `Arc`s in and out; no pixel work happens while
/// the lock is held.
#[derive(Default)]
pub struct FrameBuffer {
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the latest frame. Any unread previous frame is dropped.
    pub fn put_frame(&self, frame: Frame) {
        let frame = Arc::new(frame);
        {
            let mut state = self.lock();
            state.frame = Some(frame);
            state.frame_seq += 1;
            state.generation += 1;
        }
        self.changed.notify_all();
    }

    /// Replace the latest detection result.
    pub fn set_detections(&self, detections: Vec<Detection>) {
        let detections = Arc::new(detections);
        {
            let mut state = self.lock();
            state.detections = detections;
            state.generation += 1;
        }
        self.changed.notify_all();
    }

    pub fn snapshot(&self) -> FrameSnapshot {
        self.lock().snapshot()
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.lock().frame.clone()
    }

    /// Block until the generation moves past `seen_generation` or `timeout`
    /// elapses, then return a snapshot. On timeout the snapshot's generation
    /// equals `seen_generation`.
    pub fn wait_for_change(&self, seen_generation: u64, timeout: Duration) -> FrameSnapshot {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| state.generation == seen_generation)
            .unwrap_or_else(PoisonError::into_inner);
        guard.snapshot()
    }

    /// Block until a frame newer than `seen_seq` is available.
    ///
    /// Returns the frame with its sequence number, or `None` on timeout.
    pub fn wait_for_frame(&self, seen_seq: u64, timeout: Duration) -> Option<(u64, Arc<Frame>)> {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| state.frame_seq == seen_seq)
            .unwrap_or_else(PoisonError::into_inner);
        if guard.frame_seq == seen_seq {
            return None;
        }
        guard.frame.clone().map(|frame| (guard.frame_seq, frame))
    }

    /// Wake every waiter so it can re-check its stop condition.
    pub fn wake_all(&self) {
        self.changed.notify_all();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use std::thread;
    use std::time::Instant;

    fn detection(confidence: f32) -> Detection {
        Detection::new(BoundingBox::new(0, 0, 4, 4), confidence, 0)
    }

    #[test]
    fn frame_rejects_mismatched_length() {
        assert!(Frame::new(4, 4, vec![0; 10]).is_err());
        assert!(Frame::new(4, 4, vec![0; 48]).is_ok());
    }

    #[test]
    fn newest_frame_wins() {
        let buffer = FrameBuffer::new();
        buffer.put_frame(Frame::solid(2, 2, [1, 1, 1]));
        buffer.put_frame(Frame::solid(2, 2, [2, 2, 2]));

        let snap = buffer.snapshot();
        assert_eq!(snap.frame_seq, 2);
        assert_eq!(snap.frame.unwrap().pixels()[0], 2);
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let buffer = FrameBuffer::new();
        buffer.put_frame(Frame::solid(2, 2, [9, 9, 9]));
        buffer.set_detections(vec![detection(0.8)]);
        let snap = buffer.snapshot();

        buffer.put_frame(Frame::solid(2, 2, [0, 0, 0]));
        buffer.set_detections(Vec::new());

        assert_eq!(snap.frame.unwrap().pixels()[0], 9);
        assert_eq!(snap.detections.len(), 1);
    }

    #[test]
    fn wait_for_frame_times_out_without_writes() {
        let buffer = FrameBuffer::new();
        let start = Instant::now();
        assert!(buffer.wait_for_frame(0, Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn wait_for_frame_wakes_on_write() {
        let buffer = Arc::new(FrameBuffer::new());
        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buffer.put_frame(Frame::solid(2, 2, [5, 5, 5]));
            })
        };
        let (seq, frame) = buffer
            .wait_for_frame(0, Duration::from_secs(5))
            .expect("frame delivered");
        writer.join().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(frame.pixels()[0], 5);
    }

    #[test]
    fn detections_bump_generation_but_not_frame_seq() {
        let buffer = FrameBuffer::new();
        buffer.put_frame(Frame::solid(2, 2, [1, 1, 1]));
        buffer.set_detections(vec![detection(0.9)]);
        let snap = buffer.snapshot();
        assert_eq!(snap.generation, 2);
        assert_eq!(snap.frame_seq, 1);
    }

    #[test]
    fn concurrent_readers_never_observe_torn_pairs() {
        // Writer publishes frame N and then N detections; a reader must only
        // ever see a detection count of N or N-1 for a frame tagged N.
        let buffer = Arc::new(FrameBuffer::new());
        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for n in 1..=200u8 {
                    buffer.put_frame(Frame::solid(1, 1, [n, n, n]));
                    buffer.set_detections((0..n).map(|_| detection(0.9)).collect());
                }
            })
        };
        let mut checks = 0;
        while !writer.is_finished() || checks == 0 {
            let snap = buffer.snapshot();
            if let Some(frame) = &snap.frame {
                let tag = frame.pixels()[0] as usize;
                let count = snap.detections.len();
                assert!(count == tag || count + 1 == tag, "tag {tag} count {count}");
            }
            checks += 1;
        }
        writer.join().unwrap();
    }
}
