use std::fmt;

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Where a stream's frames come from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamSource {
    /// Local capture device by index (`/dev/video<n>`).
    Device(u32),
    /// Network or synthetic URL.
    Url(String),
}

impl StreamSource {
    /// Resolve viewer query parameters. A non-empty `url` wins over `cam`;
    /// with neither, device 0 is used.
    pub fn from_query(cam: Option<&str>, url: Option<&str>) -> Result<Self> {
        if let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) {
            return Ok(StreamSource::Url(url.to_string()));
        }
        match cam.map(str::trim).filter(|c| !c.is_empty()) {
            Some(cam) => cam
                .parse::<u32>()
                .map(StreamSource::Device)
                .map_err(|_| anyhow!("invalid camera index '{}'", cam)),
            None => Ok(StreamSource::Device(0)),
        }
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::from_source(self)
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSource::Device(index) => write!(f, "device {}", index),
            StreamSource::Url(url) => f.write_str(url),
        }
    }
}

/// Identity of a stream. Two sources with the same derivation share a key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn from_source(source: &StreamSource) -> Self {
        match source {
            StreamSource::Device(index) => StreamKey(format!("idx_{}", index)),
            StreamSource::Url(url) => StreamKey(format!("url_{}", url)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Device index for `idx_<n>` keys.
    pub fn device_index(&self) -> Option<u32> {
        self.0.strip_prefix("idx_")?.parse().ok()
    }

    /// Filesystem-safe rendering used in screenshot names.
    pub fn file_component(&self) -> String {
        static UNSAFE: OnceLock<Regex> = OnceLock::new();
        let re = UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.\-]").unwrap());
        re.replace_all(&self.0, "_").into_owned()
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
