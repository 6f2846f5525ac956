use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use gunwatch::ingest::{MjpegFileReader, SyntheticClip};
use gunwatch::{
    Annotator, BatchJob, BatchProcessor, BoundingBox, ClassNames, Detection, FrameSink, JobId,
    MjpegFileSink, ProgressStore, StubBackend, VideoReader,
};

fn processor(progress: Arc<ProgressStore>) -> BatchProcessor {
    let detector = Arc::new(StubBackend::with_detections(vec![Detection::new(
        BoundingBox::new(4, 4, 20, 20),
        0.92,
        1,
    )]));
    BatchProcessor::new(
        detector,
        Annotator::new(ClassNames::default()),
        0.7,
        progress,
    )
    .with_progress_grace(Duration::from_millis(10))
}

fn write_input_clip(path: &Path, frames: u64) -> Result<()> {
    let mut clip = SyntheticClip::open(&format!(
        "stub://input?frames={}&width=48&height=32",
        frames
    ))?;
    let mut sink = MjpegFileSink::create(path, 85)?;
    while let Some(frame) = clip.next_frame()? {
        sink.write_frame(&frame)?;
    }
    sink.finish()?;
    Ok(())
}

#[test]
fn ten_frame_job_reports_monotonic_progress_to_100() -> Result<()> {
    let dir = TempDir::new()?;
    let progress = Arc::new(ProgressStore::new());
    let processor = processor(progress.clone());

    let id = JobId::new_random();
    let output = dir.path().join(BatchJob::output_name(&id, "clip.mp4"));
    let mut job = BatchJob::new(id.clone(), "stub://clip".into(), output.clone());
    let mut reader = SyntheticClip::open("stub://clip?frames=10&width=48&height=32")?;
    let mut sink = MjpegFileSink::create(&output, 80)?;

    let mut seen = Vec::new();
    let report = processor.process_with(&mut job, &mut reader, &mut sink, &mut |p| seen.push(p))?;

    assert_eq!(seen.first(), Some(&0));
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert!(seen.contains(&50));
    assert_eq!(report.frames_processed, 10);
    assert_eq!(report.frames_with_detections, 10);
    assert_eq!(report.write_failures, 0);
    assert_eq!(job.processed_frames, 10);

    // Record cleared after the grace period; unknown jobs read as complete.
    assert!(!progress.contains(&id));
    assert_eq!(progress.get(&id), 100);

    let written = MjpegFileReader::open(output.to_str().unwrap())?;
    assert_eq!(written.frame_count_hint(), Some(10));
    Ok(())
}

#[test]
fn process_file_annotates_mjpeg_input() -> Result<()> {
    let dir = TempDir::new()?;
    let id = JobId::new_random();
    let input = dir.path().join(BatchJob::upload_name(&id, "door cam.mjpeg"));
    let output = dir.path().join(BatchJob::output_name(&id, "door cam.mjpeg"));
    write_input_clip(&input, 6)?;

    let progress = Arc::new(ProgressStore::new());
    let report = processor(progress.clone()).process_file(id.clone(), &input, &output)?;
    assert_eq!(report.frames_processed, 6);
    assert_eq!(report.output_path, output);
    assert!(output.exists());
    assert!(!progress.contains(&id));

    let mut reader = MjpegFileReader::open(output.to_str().unwrap())?;
    let first = reader.next_frame()?.expect("annotated frame");
    assert_eq!((first.width(), first.height()), (48, 32));
    Ok(())
}

#[test]
fn missing_input_fails_without_output_progress() {
    let dir = TempDir::new().unwrap();
    let progress = Arc::new(ProgressStore::new());
    let id = JobId::new_random();
    let result = processor(progress.clone()).process_file(
        id.clone(),
        &dir.path().join("absent.mjpeg"),
        &dir.path().join("out.mjpeg"),
    );
    assert!(result.is_err());
    assert!(!progress.contains(&id));
}

#[test]
fn concurrent_jobs_keep_separate_progress() -> Result<()> {
    let progress = Arc::new(ProgressStore::new());
    let processor = Arc::new(processor(progress.clone()).with_progress_grace(Duration::ZERO));
    let dir = TempDir::new()?;

    let handles: Vec<_> = (0..3)
        .map(|n| {
            let processor = processor.clone();
            let output = dir.path().join(format!("out_{n}.mjpeg"));
            std::thread::spawn(move || {
                let id = JobId::new_random();
                let clip = format!("stub://job{n}?frames={}&width=16&height=16", 4 + n);
                let report = processor.process_file(id, Path::new(&clip), &output)?;
                anyhow::Ok(report.frames_processed)
            })
        })
        .collect();

    let mut counts: Vec<u64> = handles
        .into_iter()
        .map(|h| h.join().expect("job thread"))
        .collect::<Result<_>>()?;
    counts.sort();
    assert_eq!(counts, vec![4, 5, 6]);
    Ok(())
}
