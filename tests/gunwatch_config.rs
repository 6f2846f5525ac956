use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use gunwatch::{AlertSelection, GunwatchConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "GUNWATCH_CONFIG",
        "GUNWATCH_API_ADDR",
        "GUNWATCH_DETECTOR",
        "GUNWATCH_MODEL_PATH",
        "GUNWATCH_CONFIDENCE_THRESHOLD",
        "GUNWATCH_DETECTION_SKIP",
        "GUNWATCH_ALERT_COOLDOWN",
        "GUNWATCH_ALERT_WEBHOOK",
        "GUNWATCH_ALERT_MQTT",
        "GUNWATCH_SCREENSHOT_DIR",
        "GUNWATCH_OUTPUT_DIR",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = GunwatchConfig::load().expect("load defaults");
    assert_eq!(cfg.api_addr, "127.0.0.1:8080");
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.detector.model_path, PathBuf::from("best.onnx"));
    assert_eq!(cfg.detector.confidence_threshold, 0.7);
    assert_eq!(cfg.capture.detection_skip, 4);
    assert_eq!(cfg.alert.cooldown, Duration::from_secs(60));
    assert_eq!(cfg.alert.selection, AlertSelection::First);
    assert!(cfg.alert.webhook_url.is_none());
    assert_eq!(cfg.screenshots.dir, PathBuf::from("static/screenshots"));
    assert_eq!(cfg.screenshots.cooldown, Duration::from_secs(10));
    assert_eq!(cfg.highlight_window, Duration::from_secs(10));
    assert_eq!(cfg.batch.progress_grace, Duration::from_millis(500));
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "api": { "addr": "0.0.0.0:9000", "max_upload_bytes": 1048576 },
        "detector": {
            "confidence_threshold": 0.5,
            "class_names": ["pistol", "long_gun"]
        },
        "capture": { "width": 640, "height": 480, "detection_skip": 2 },
        "alert": {
            "cooldown_secs": 30,
            "selection": "max_confidence",
            "mqtt_topic": "site/alerts"
        },
        "screenshots": { "dir": "/var/lib/gunwatch/shots", "cooldown_secs": 5 },
        "streamer": { "jpeg_quality": 75 },
        "highlight": { "window_secs": 20 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("GUNWATCH_CONFIG", file.path());
    std::env::set_var("GUNWATCH_DETECTION_SKIP", "6");
    std::env::set_var("GUNWATCH_ALERT_WEBHOOK", "http://127.0.0.1:9/hook");
    std::env::set_var("GUNWATCH_OUTPUT_DIR", "/tmp/gunwatch-out");

    let cfg = GunwatchConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.max_upload_bytes, 1_048_576);
    assert_eq!(cfg.detector.confidence_threshold, 0.5);
    assert_eq!(cfg.class_names().label(1), "long_gun");
    assert_eq!(cfg.capture.width, 640);
    assert_eq!(cfg.capture.detection_skip, 6);
    assert_eq!(cfg.alert.cooldown, Duration::from_secs(30));
    assert_eq!(cfg.alert.selection, AlertSelection::MaxConfidence);
    assert_eq!(cfg.alert.mqtt_topic, "site/alerts");
    assert_eq!(
        cfg.alert.webhook_url.as_deref(),
        Some("http://127.0.0.1:9/hook")
    );
    assert_eq!(cfg.screenshots.cooldown, Duration::from_secs(5));
    assert_eq!(cfg.jpeg_quality, 75);
    assert_eq!(cfg.highlight_window, Duration::from_secs(20));
    assert_eq!(cfg.batch.output_dir, PathBuf::from("/tmp/gunwatch-out"));

    let pipeline = cfg.pipeline_settings();
    assert_eq!(pipeline.detection_skip, 6);
    assert_eq!(pipeline.capture.height, 480);
    assert_eq!(cfg.streamer_settings().jpeg_quality, 75);

    clear_env();
}

#[test]
fn rejects_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("GUNWATCH_CONFIDENCE_THRESHOLD", "1.5");
    assert!(GunwatchConfig::load().is_err());
    clear_env();

    std::env::set_var("GUNWATCH_DETECTION_SKIP", "0");
    assert!(GunwatchConfig::load().is_err());
    clear_env();

    std::env::set_var("GUNWATCH_ALERT_COOLDOWN", "soon");
    let err = GunwatchConfig::load().unwrap_err();
    assert!(err.to_string().contains("GUNWATCH_ALERT_COOLDOWN"));
    clear_env();
}

#[test]
fn rejects_malformed_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("GUNWATCH_CONFIG", file.path());
    let err = GunwatchConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    std::env::set_var("GUNWATCH_CONFIG", "/nonexistent/gunwatch.json");
    assert!(GunwatchConfig::load().is_err());
    clear_env();
}
