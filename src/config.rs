use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::alert::AlertSelection;
use crate::detect::ClassNames;
use crate::ingest::CaptureSettings;
use crate::stream::{PipelineSettings, RetryPolicy, StreamerSettings};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_MODEL_PATH: &str = "best.onnx";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;
const DEFAULT_CLASS_NAMES: [&str; 4] = ["handgun", "rifle", "shotgun", "sniper"];
const DEFAULT_CAPTURE_WIDTH: u32 = 1280;
const DEFAULT_CAPTURE_HEIGHT: u32 = 720;
const DEFAULT_CAPTURE_FPS: u32 = 30;
const DEFAULT_DETECTION_SKIP: u64 = 4;
const DEFAULT_STOP_GRACE_MS: u64 = 2_000;
const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 60;
const DEFAULT_MQTT_TOPIC: &str = "gunwatch/alerts";
const DEFAULT_SCREENSHOT_DIR: &str = "static/screenshots";
const DEFAULT_SCREENSHOT_COOLDOWN_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_HIGHLIGHT_WINDOW_SECS: u64 = 10;
const DEFAULT_OUTPUT_DIR: &str = "static/outputs";
const DEFAULT_PROGRESS_GRACE_MS: u64 = 500;

#[derive(Debug, Deserialize, Default)]
struct GunwatchConfigFile {
    api: Option<ApiConfigFile>,
    detector: Option<DetectorConfigFile>,
    capture: Option<CaptureConfigFile>,
    alert: Option<AlertConfigFile>,
    screenshots: Option<ScreenshotConfigFile>,
    streamer: Option<StreamerConfigFile>,
    highlight: Option<HighlightConfigFile>,
    batch: Option<BatchConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_upload_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    class_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    detection_skip: Option<u64>,
    max_consecutive_failures: Option<u32>,
    stop_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    cooldown_secs: Option<u64>,
    selection: Option<AlertSelection>,
    webhook_url: Option<String>,
    mqtt_broker_addr: Option<String>,
    mqtt_topic: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ScreenshotConfigFile {
    dir: Option<PathBuf>,
    cooldown_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamerConfigFile {
    poll_interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct HighlightConfigFile {
    window_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BatchConfigFile {
    output_dir: Option<PathBuf>,
    progress_grace_ms: Option<u64>,
}

/// Daemon configuration: JSON file (`GUNWATCH_CONFIG`), then env overrides.
#[derive(Debug, Clone)]
pub struct GunwatchConfig {
    pub api_addr: String,
    pub max_upload_bytes: u64,
    pub detector: DetectorSettings,
    pub capture: CaptureConfig,
    pub alert: AlertSettings,
    pub screenshots: ScreenshotSettings,
    pub poll_interval: Duration,
    pub jpeg_quality: u8,
    pub highlight_window: Duration,
    pub batch: BatchSettings,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    pub class_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub detection_skip: u64,
    pub max_consecutive_failures: u32,
    pub stop_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub cooldown: Duration,
    pub selection: AlertSelection,
    pub webhook_url: Option<String>,
    pub mqtt_broker_addr: Option<String>,
    pub mqtt_topic: String,
}

#[derive(Debug, Clone)]
pub struct ScreenshotSettings {
    pub dir: PathBuf,
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub output_dir: PathBuf,
    pub progress_grace: Duration,
}

impl Default for GunwatchConfig {
    fn default() -> Self {
        Self::from_file(GunwatchConfigFile::default())
    }
}

impl GunwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GUNWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GunwatchConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let alert = file.alert.unwrap_or_default();
        let screenshots = file.screenshots.unwrap_or_default();
        let streamer = file.streamer.unwrap_or_default();
        let highlight = file.highlight.unwrap_or_default();
        let batch = file.batch.unwrap_or_default();

        Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            max_upload_bytes: api.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detector
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                class_names: detector.class_names.unwrap_or_else(|| {
                    DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect()
                }),
            },
            capture: CaptureConfig {
                width: capture.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                target_fps: capture.target_fps.unwrap_or(DEFAULT_CAPTURE_FPS),
                detection_skip: capture.detection_skip.unwrap_or(DEFAULT_DETECTION_SKIP),
                max_consecutive_failures: capture.max_consecutive_failures.unwrap_or(0),
                stop_grace: Duration::from_millis(
                    capture.stop_grace_ms.unwrap_or(DEFAULT_STOP_GRACE_MS),
                ),
            },
            alert: AlertSettings {
                cooldown: Duration::from_secs(
                    alert.cooldown_secs.unwrap_or(DEFAULT_ALERT_COOLDOWN_SECS),
                ),
                selection: alert.selection.unwrap_or_default(),
                webhook_url: alert.webhook_url,
                mqtt_broker_addr: alert.mqtt_broker_addr,
                mqtt_topic: alert
                    .mqtt_topic
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
            },
            screenshots: ScreenshotSettings {
                dir: screenshots
                    .dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SCREENSHOT_DIR)),
                cooldown: Duration::from_secs(
                    screenshots
                        .cooldown_secs
                        .unwrap_or(DEFAULT_SCREENSHOT_COOLDOWN_SECS),
                ),
            },
            poll_interval: Duration::from_millis(
                streamer.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            jpeg_quality: streamer.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            highlight_window: Duration::from_secs(
                highlight.window_secs.unwrap_or(DEFAULT_HIGHLIGHT_WINDOW_SECS),
            ),
            batch: BatchSettings {
                output_dir: batch
                    .output_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
                progress_grace: Duration::from_millis(
                    batch.progress_grace_ms.unwrap_or(DEFAULT_PROGRESS_GRACE_MS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_string("GUNWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(backend) = env_string("GUNWATCH_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_string("GUNWATCH_MODEL_PATH") {
            self.detector.model_path = PathBuf::from(path);
        }
        if let Some(threshold) = env_parse::<f32>("GUNWATCH_CONFIDENCE_THRESHOLD")? {
            self.detector.confidence_threshold = threshold;
        }
        if let Some(skip) = env_parse::<u64>("GUNWATCH_DETECTION_SKIP")? {
            self.capture.detection_skip = skip;
        }
        if let Some(secs) = env_parse::<u64>("GUNWATCH_ALERT_COOLDOWN")? {
            self.alert.cooldown = Duration::from_secs(secs);
        }
        if let Some(url) = env_string("GUNWATCH_ALERT_WEBHOOK") {
            self.alert.webhook_url = Some(url);
        }
        if let Some(addr) = env_string("GUNWATCH_ALERT_MQTT") {
            self.alert.mqtt_broker_addr = Some(addr);
        }
        if let Some(dir) = env_string("GUNWATCH_SCREENSHOT_DIR") {
            self.screenshots.dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("GUNWATCH_OUTPUT_DIR") {
            self.batch.output_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let threshold = self.detector.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        if self.capture.detection_skip == 0 {
            return Err(anyhow!("detection skip must be at least 1"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!(
                "jpeg quality must be within 1..=100, got {}",
                self.jpeg_quality
            ));
        }
        if self.alert.cooldown.is_zero() {
            return Err(anyhow!("alert cooldown must be greater than zero"));
        }
        if self.screenshots.cooldown.is_zero() {
            return Err(anyhow!("screenshot cooldown must be greater than zero"));
        }
        if self.detector.class_names.is_empty() {
            return Err(anyhow!("at least one class name is required"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture size must be non-zero"));
        }
        Ok(())
    }

    pub fn class_names(&self) -> ClassNames {
        ClassNames::new(self.detector.class_names.clone())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            width: self.capture.width,
            height: self.capture.height,
            target_fps: self.capture.target_fps,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            capture: self.capture_settings(),
            confidence_threshold: self.detector.confidence_threshold,
            detection_skip: self.capture.detection_skip,
            alert_selection: self.alert.selection,
            retry: RetryPolicy {
                max_consecutive_failures: self.capture.max_consecutive_failures,
                ..RetryPolicy::default()
            },
            stop_grace: self.capture.stop_grace,
            ..PipelineSettings::default()
        }
    }

    pub fn streamer_settings(&self) -> StreamerSettings {
        StreamerSettings {
            poll_interval: self.poll_interval,
            jpeg_quality: self.jpeg_quality,
            ..StreamerSettings::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<GunwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", name, raw)),
        None => Ok(None),
    }
}
