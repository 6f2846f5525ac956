//! batch_process - run one video file through detection and annotation.
//!
//! Writes `processed_<job>_<stem>.mjpeg` into the output directory and shows
//! percent-complete while the job runs.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gunwatch::{
    build_detector, Annotator, BatchJob, BatchProcessor, GunwatchConfig, JobId, ProgressStore,
};

#[path = "../ui.rs"]
mod ui;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(
    name = "batch_process",
    about = "Annotate weapon detections in a video file"
)]
struct Args {
    /// Input video (.mjpeg, stub://..., or any container with ingest-file-ffmpeg)
    #[arg(long, value_name = "PATH")]
    input: String,

    /// Directory for the annotated output
    #[arg(long, value_name = "DIR", env = "GUNWATCH_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Minimum confidence for a detection to be drawn
    #[arg(long, value_name = "0..1")]
    threshold: Option<f32>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());

    let config = GunwatchConfig::load()?;
    let threshold = args
        .threshold
        .unwrap_or(config.detector.confidence_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(anyhow!("--threshold must be within [0, 1], got {}", threshold));
    }
    let output_dir = args
        .output_dir
        .unwrap_or_else(|| config.batch.output_dir.clone());
    std::fs::create_dir_all(&output_dir)?;

    let detector = build_detector(&config.detector.backend, &config.detector.model_path)?;
    let progress = Arc::new(ProgressStore::new());
    let processor = Arc::new(
        BatchProcessor::new(
            detector,
            Annotator::new(config.class_names()),
            threshold,
            progress.clone(),
        )
        .with_quality(config.jpeg_quality)
        .with_progress_grace(Duration::ZERO),
    );

    let id = JobId::new_random();
    let file_name = input_file_name(&args.input);
    let output = output_dir.join(BatchJob::output_name(&id, &file_name));
    let input = PathBuf::from(&args.input);

    progress.publish(&id, 0);
    let worker = {
        let processor = processor.clone();
        let id = id.clone();
        let output = output.clone();
        std::thread::Builder::new()
            .name(format!("batch-{}", id))
            .spawn(move || processor.process_file(id, &input, &output))?
    };

    let mut bar = ui.job(&file_name);
    while !worker.is_finished() {
        bar.set(progress.get(&id));
        std::thread::sleep(POLL_INTERVAL);
    }
    let result = worker
        .join()
        .map_err(|_| anyhow!("batch worker panicked"))?;

    match result {
        Ok(report) => {
            bar.finish(&format!(
                "{} frames, {} with detections",
                report.frames_processed, report.frames_with_detections
            ));
            if report.write_failures > 0 {
                eprintln!("warning: {} frame writes failed", report.write_failures);
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(err) => {
            bar.abandon(&format!("{:#}", err));
            Err(err)
        }
    }
}

fn input_file_name(input: &str) -> String {
    if input.starts_with("stub://") {
        return "stub.mjpeg".to_string();
    }
    std::path::Path::new(input)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}
