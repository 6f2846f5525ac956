use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

const JOB_ID_BYTES: usize = 16;

/// Opaque job identifier: 16 random bytes, lowercase hex.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new_random() -> Self {
        JobId(hex::encode(rand::random::<[u8; JOB_ID_BYTES]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let bytes = hex::decode(value).map_err(|_| anyhow!("job id is not hex: '{}'", value))?;
        if bytes.len() != JOB_ID_BYTES {
            return Err(anyhow!(
                "job id must be {} hex characters",
                JOB_ID_BYTES * 2
            ));
        }
        Ok(JobId(value.to_ascii_lowercase()))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One batch job's paths and counters.
#[derive(Clone, Debug)]
pub struct BatchJob {
    pub id: JobId,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub total_frames: u64,
    pub processed_frames: u64,
}

impl BatchJob {
    pub fn new(id: JobId, input_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            id,
            input_path,
            output_path,
            total_frames: 0,
            processed_frames: 0,
        }
    }

    /// Storage name for an uploaded file: `<job>_<filename>`.
    pub fn upload_name(id: &JobId, filename: &str) -> String {
        format!("{}_{}", id, sanitize_filename(filename))
    }

    /// Annotated output name: `processed_<job>_<stem>.mjpeg`.
    pub fn output_name(id: &JobId, filename: &str) -> String {
        let sanitized = sanitize_filename(filename);
        let stem = Path::new(&sanitized)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("video");
        format!("processed_{}_{}.mjpeg", id, stem)
    }

    /// Whether `name` has the shape `output_name` produces. Download requests
    /// are limited to such names.
    pub fn is_output_name(name: &str) -> bool {
        name.starts_with("processed_")
            && name.ends_with(".mjpeg")
            && !name.contains("..")
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    }
}

/// Keep only the final path component and replace anything unusual.
fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_32_hex_chars_and_parse_back() {
        let id = JobId::new_random();
        assert_eq!(id.as_str().len(), 32);
        assert_eq!(id.as_str().parse::<JobId>().unwrap(), id);
        assert_ne!(JobId::new_random(), id);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!("xyz".parse::<JobId>().is_err());
        assert!("abcd".parse::<JobId>().is_err());
    }

    #[test]
    fn file_names_follow_job_layout() {
        let id: JobId = "00112233445566778899aabbccddeeff".parse().unwrap();
        assert_eq!(
            BatchJob::upload_name(&id, "../../etc/clip one.mp4"),
            "00112233445566778899aabbccddeeff_clip_one.mp4"
        );
        assert_eq!(
            BatchJob::output_name(&id, "clip.mp4"),
            "processed_00112233445566778899aabbccddeeff_clip.mjpeg"
        );
        assert_eq!(BatchJob::upload_name(&id, ".."), format!("{}_upload", id));
    }

    #[test]
    fn only_processed_outputs_are_downloadable() {
        let id = JobId::new_random();
        assert!(BatchJob::is_output_name(&BatchJob::output_name(&id, "gate cam.mp4")));
        assert!(!BatchJob::is_output_name(&BatchJob::upload_name(&id, "gate.mp4")));
        assert!(!BatchJob::is_output_name("processed_../../etc/passwd.mjpeg"));
        assert!(!BatchJob::is_output_name("processed_x/y.mjpeg"));
        assert!(!BatchJob::is_output_name("processed_x.jpg"));
    }
}
