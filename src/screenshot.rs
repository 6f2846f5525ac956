//! Per-stream screenshot capture and history listing.
//!
//! `ScreenshotThrottle` enforces a cooldown per stream, independent of the
//! global alert cooldown. `ScreenshotStore` writes annotated JPEGs named
//! `screenshot_<stream>_<YYYYmmdd_HHMMSS>.jpg` and lists them newest first.

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::annotate::Annotator;
use crate::detect::Detection;
use crate::frame::Frame;
use crate::stream::StreamKey;

const URL_PREFIX: &str = "/static/screenshots";

/// Per-stream cooldown clocks. Entries exist only while a stream is running.
pub struct ScreenshotThrottle {
    cooldown: Duration,
    last_capture: Mutex<HashMap<StreamKey, Option<Instant>>>,
}

impl ScreenshotThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_capture: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, key: &StreamKey) {
        self.lock().insert(key.clone(), None);
    }

    pub fn remove(&self, key: &StreamKey) {
        self.lock().remove(key);
    }

    pub fn is_registered(&self, key: &StreamKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Claim the capture slot for `key` if its cooldown has elapsed.
    ///
    /// Check and update happen under one lock. Unregistered keys never capture.
    pub fn try_capture(&self, key: &StreamKey, now: Instant) -> bool {
        let mut clocks = self.lock();
        let Some(last) = clocks.get_mut(key) else {
            return false;
        };
        if let Some(previous) = *last {
            if now.saturating_duration_since(previous) < self.cooldown {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StreamKey, Option<Instant>>> {
        self.last_capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// History entry as served to the UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScreenshotEntry {
    pub filename: String,
    /// File modification time, local, `%Y-%m-%d %H:%M:%S`.
    pub timestamp: String,
    pub url: String,
}

pub struct ScreenshotStore {
    dir: PathBuf,
    annotator: Annotator,
    quality: u8,
}

impl ScreenshotStore {
    /// Open the store, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, annotator: Annotator, quality: u8) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create screenshot dir {}", dir.display()))?;
        Ok(Self {
            dir,
            annotator,
            quality,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Annotate `frame` with `detections` and write it as a JPEG.
    pub fn save(
        &self,
        key: &StreamKey,
        frame: &Frame,
        detections: &[Detection],
        now: DateTime<Local>,
    ) -> Result<PathBuf> {
        let jpeg = self.annotator.annotate_jpeg(frame, detections, self.quality)?;
        let path = self.unused_path(&screenshot_filename(key, now));
        fs::write(&path, jpeg)
            .with_context(|| format!("write screenshot {}", path.display()))?;
        log::info!("screenshot saved: {}", path.display());
        Ok(path)
    }

    /// All `.jpg` screenshots, newest first.
    pub fn list(&self) -> Result<Vec<ScreenshotEntry>> {
        let mut found: Vec<(SystemTime, ScreenshotEntry)> = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("list screenshot dir {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !filename.to_ascii_lowercase().ends_with(".jpg") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .with_context(|| format!("stat screenshot {}", filename))?;
            let timestamp = DateTime::<Local>::from(modified)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string();
            let url = format!("{}/{}", URL_PREFIX, filename);
            found.push((
                modified,
                ScreenshotEntry {
                    filename,
                    timestamp,
                    url,
                },
            ));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.filename.cmp(&a.1.filename)));
        Ok(found.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Every listed screenshot packed into an in-memory zip, newest first.
    pub fn archive(&self) -> Result<Vec<u8>> {
        let entries = self.list()?;
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        // JPEG payloads do not deflate.
        let options =
            FileOptions::<()>::default().compression_method(zip::CompressionMethod::Stored);
        for entry in &entries {
            let path = self.dir.join(&entry.filename);
            let contents = match fs::read(&path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("read screenshot {}", path.display()))
                }
            };
            zip.start_file(entry.filename.as_str(), options)?;
            zip.write_all(&contents)?;
        }
        let archive = zip.finish()?.into_inner();
        log::info!(
            "screenshot archive: {} files, {} bytes",
            entries.len(),
            archive.len()
        );
        Ok(archive)
    }

    /// Same-second captures get a numeric suffix instead of overwriting.
    fn unused_path(&self, filename: &str) -> PathBuf {
        let candidate = self.dir.join(filename);
        if !candidate.exists() {
            return candidate;
        }
        let stem = filename.trim_end_matches(".jpg");
        (1..)
            .map(|n| self.dir.join(format!("{}_{}.jpg", stem, n)))
            .find(|path| !path.exists())
            .unwrap_or(candidate)
    }
}

pub fn screenshot_filename(key: &StreamKey, now: DateTime<Local>) -> String {
    format!(
        "screenshot_{}_{}.jpg",
        key.file_component(),
        now.format("%Y%m%d_%H%M%S")
    )
}
