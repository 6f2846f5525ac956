//! gunwatchd - weapon detection daemon
//!
//! This daemon:
//! 1. Loads configuration (`GUNWATCH_CONFIG` JSON + `GUNWATCH_*` overrides)
//! 2. Resolves the detector backend and alert transports
//! 3. Serves viewers, uploads and status queries over HTTP
//! 4. Starts stream pipelines lazily as viewers ask for them
//! 5. On Ctrl-C, stops every pipeline and the API server

use anyhow::Result;
use std::sync::{mpsc, Arc};

use gunwatch::{
    build_detector, AlertThrottle, Annotator, ApiConfig, ApiServer, ApiState, BatchProcessor,
    FanoutNotifier, GunwatchConfig, LogNotifier, MqttNotifier, Notifier, PipelineServices,
    ProgressStore, ScreenshotStore, ScreenshotThrottle, StreamSupervisor, WebhookNotifier,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = GunwatchConfig::load()?;
    log::info!(
        "gunwatchd {} starting (threshold {:.2}, detection every {} frames)",
        env!("CARGO_PKG_VERSION"),
        config.detector.confidence_threshold,
        config.capture.detection_skip
    );

    let detector = build_detector(&config.detector.backend, &config.detector.model_path)?;
    let annotator = Annotator::new(config.class_names());

    let notifier = build_notifier(&config)?;
    let alerts = Arc::new(AlertThrottle::new(config.alert.cooldown, notifier));
    let screenshot_throttle = Arc::new(ScreenshotThrottle::new(config.screenshots.cooldown));
    let screenshots = Arc::new(ScreenshotStore::new(
        config.screenshots.dir.clone(),
        annotator.clone(),
        config.jpeg_quality,
    )?);
    log::info!("screenshots stored in {}", screenshots.dir().display());

    let services = PipelineServices::new(
        detector.clone(),
        annotator.clone(),
        alerts,
        screenshot_throttle,
    )
    .with_screenshots(screenshots.clone())
    .with_settings(config.pipeline_settings())
    .with_streamer(config.streamer_settings());
    let supervisor = Arc::new(StreamSupervisor::new(services));

    let processor = Arc::new(
        BatchProcessor::new(
            detector,
            annotator,
            config.detector.confidence_threshold,
            Arc::new(ProgressStore::new()),
        )
        .with_quality(config.jpeg_quality)
        .with_progress_grace(config.batch.progress_grace),
    );

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        max_upload_bytes: config.max_upload_bytes,
        output_dir: config.batch.output_dir.clone(),
        highlight_window: config.highlight_window,
    };
    let api_state = ApiState {
        supervisor: supervisor.clone(),
        processor,
        screenshots: Some(screenshots),
    };
    let api_handle = ApiServer::new(api_config, api_state).spawn()?;
    log::info!("gunwatchd listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("gunwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping streams...");
    supervisor.stop_all();
    api_handle.stop()?;
    log::info!("gunwatchd stopped");

    Ok(())
}

/// Configured transports, or the log-only notifier when none are set.
fn build_notifier(config: &GunwatchConfig) -> Result<Arc<dyn Notifier>> {
    let mut transports: Vec<Arc<dyn Notifier>> = Vec::new();
    if let Some(url) = &config.alert.webhook_url {
        transports.push(Arc::new(WebhookNotifier::new(url)?));
        log::info!("alerts: webhook {}", url);
    }
    if let Some(broker) = &config.alert.mqtt_broker_addr {
        transports.push(Arc::new(MqttNotifier::connect(
            broker,
            &config.alert.mqtt_topic,
        )?));
        log::info!("alerts: mqtt {} topic {}", broker, config.alert.mqtt_topic);
    }
    if transports.is_empty() {
        log::warn!("alerts: no transport configured, alerts are only logged");
        return Ok(Arc::new(LogNotifier));
    }
    Ok(Arc::new(FanoutNotifier::new(transports)))
}
