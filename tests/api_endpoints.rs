use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use gunwatch::{
    AlertThrottle, Annotator, ApiConfig, ApiHandle, ApiServer, ApiState, BatchProcessor,
    BoundingBox, CaptureSettings, ClassNames, Detection, LogNotifier, PipelineServices,
    PipelineSettings, ProgressStore, ScreenshotStore, ScreenshotThrottle, StreamSupervisor,
    StubBackend,
};

struct Harness {
    api: Option<ApiHandle>,
    supervisor: Arc<StreamSupervisor>,
    dir: TempDir,
}

impl Harness {
    fn start(detections: Vec<Detection>) -> Self {
        let dir = TempDir::new().unwrap();
        let detector = Arc::new(StubBackend::with_detections(detections));
        let annotator = Annotator::new(ClassNames::default());
        let screenshots = Arc::new(
            ScreenshotStore::new(dir.path().join("screenshots"), annotator.clone(), 80).unwrap(),
        );
        let services = PipelineServices::new(
            detector.clone(),
            annotator.clone(),
            Arc::new(AlertThrottle::new(Duration::from_secs(60), Arc::new(LogNotifier))),
            Arc::new(ScreenshotThrottle::new(Duration::from_secs(10))),
        )
        .with_screenshots(screenshots.clone())
        .with_settings(PipelineSettings {
            capture: CaptureSettings {
                width: 32,
                height: 24,
                target_fps: 100,
            },
            detection_skip: 1,
            idle_wait: Duration::from_millis(10),
            ..PipelineSettings::default()
        });
        let supervisor = Arc::new(StreamSupervisor::new(services));
        let processor = Arc::new(
            BatchProcessor::new(detector, annotator, 0.7, Arc::new(ProgressStore::new()))
                .with_progress_grace(Duration::from_millis(50)),
        );
        let cfg = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            max_upload_bytes: 1024 * 1024,
            output_dir: dir.path().join("outputs"),
            highlight_window: Duration::from_secs(10),
        };
        let state = ApiState {
            supervisor: supervisor.clone(),
            processor,
            screenshots: Some(screenshots),
        };
        let api = ApiServer::new(cfg, state).spawn().unwrap();
        Self {
            api: Some(api),
            supervisor,
            dir,
        }
    }

    fn connect(&self) -> TcpStream {
        let addr = self.api.as_ref().unwrap().addr;
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn request(&self, method: &str, path: &str, body: &[u8]) -> (u16, String) {
        let mut stream = self.connect();
        let head = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).unwrap();
        stream.write_all(body).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        parse_response(&response)
    }

    fn get(&self, path: &str) -> (u16, String) {
        self.request("GET", path, &[])
    }

    /// GET for binary bodies: status, header block, body bytes.
    fn get_bytes(&self, path: &str) -> (u16, String, Vec<u8>) {
        let mut stream = self.connect();
        let head = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(head.as_bytes()).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        let split = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response has a header block");
        let head = String::from_utf8_lossy(&response[..split]).to_string();
        let (status, _) = parse_response(&head);
        (status, head, response[split + 4..].to_vec())
    }

    fn wait_for_percent(&self, job_id: &str, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        loop {
            let (_, body) = self.get(&format!("/api/video_progress?job_id={job_id}"));
            let percent = json(&body)["percent"].as_u64().unwrap();
            assert!(percent <= 100);
            if percent == 100 || Instant::now() >= deadline {
                return percent;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.supervisor.stop_all();
        if let Some(api) = self.api.take() {
            let _ = api.stop();
        }
    }
}

fn parse_response(response: &str) -> (u16, String) {
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

fn json(body: &str) -> serde_json::Value {
    serde_json::from_str(body).unwrap_or_else(|err| panic!("invalid json {body:?}: {err}"))
}

fn gun() -> Detection {
    Detection::new(BoundingBox::new(1, 1, 10, 10), 0.9, 0)
}

#[test]
fn health_and_unknown_routes() {
    let harness = Harness::start(Vec::new());
    let (status, body) = harness.get("/health");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["status"], "ok");

    assert_eq!(harness.get("/nope").0, 404);
    assert_eq!(harness.request("POST", "/health", b"").0, 405);
    assert_eq!(harness.get("/upload_video?filename=x.mp4").0, 405);
}

#[test]
fn video_progress_defaults() {
    let harness = Harness::start(Vec::new());
    let (status, body) = harness.get("/api/video_progress");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["percent"], 0);

    let unknown = "0123456789abcdef0123456789abcdef";
    let (_, body) = harness.get(&format!("/api/video_progress?job_id={unknown}"));
    assert_eq!(json(&body)["percent"], 100);

    assert_eq!(harness.get("/api/video_progress?job_id=../etc").0, 400);
}

#[test]
fn video_feed_streams_multipart_jpeg() {
    let harness = Harness::start(Vec::new());
    let mut stream = harness.connect();
    stream
        .write_all(b"GET /video_feed?url=stub%3A%2F%2Ffeed HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "stream closed early");
        received.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&received);
        if text.matches("--frame\r\n").count() >= 2 {
            break;
        }
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(text.matches("Content-Type: image/jpeg").count() >= 2);

    let (_, body) = harness.get("/api/streams");
    assert_eq!(json(&body)["streams"][0], "url_stub://feed");

    let (status, _) = harness.get("/stop_video?url=stub%3A%2F%2Ffeed");
    assert_eq!(status, 204);
    let (_, body) = harness.get("/api/streams");
    assert_eq!(json(&body)["streams"].as_array().map(Vec::len), Some(0));
}

#[test]
fn bad_camera_index_is_rejected() {
    let harness = Harness::start(Vec::new());
    assert_eq!(harness.get("/video_feed?cam=front").0, 400);
    assert_eq!(harness.get("/stop_video?cam=-1").0, 400);
}

#[test]
fn upload_runs_a_batch_job() {
    let harness = Harness::start(vec![gun()]);
    let clip = harness.dir.path().join("clip.mjpeg");
    {
        use gunwatch::{FrameSink, MjpegFileSink, VideoReader};
        let mut source = gunwatch::ingest::SyntheticClip::open("stub://c?frames=5&width=24&height=16")
            .unwrap();
        let mut sink = MjpegFileSink::create(&clip, 80).unwrap();
        while let Some(frame) = source.next_frame().unwrap() {
            sink.write_frame(&frame).unwrap();
        }
        sink.finish().unwrap();
    }
    let bytes = std::fs::read(&clip).unwrap();

    let (status, body) = harness.request("POST", "/upload_video?filename=clip.mjpeg", &bytes);
    assert_eq!(status, 200);
    let reply = json(&body);
    assert_eq!(reply["success"], true);
    let job_id = reply["job_id"].as_str().unwrap().to_string();
    assert_eq!(job_id.len(), 32);

    let outputs = harness.dir.path().join("outputs");
    let processed = outputs.join(format!("processed_{job_id}_clip.mjpeg"));
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (_, body) = harness.get(&format!("/api/video_progress?job_id={job_id}"));
        let percent = json(&body)["percent"].as_u64().unwrap();
        assert!(percent <= 100);
        if percent == 100 && processed.exists() {
            break;
        }
        assert!(Instant::now() < deadline, "job did not finish");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(outputs.join(format!("{job_id}_clip.mjpeg")).exists());

    let download_url = reply["download_url"].as_str().unwrap();
    assert_eq!(
        download_url,
        format!("/download?file=processed_{job_id}_clip.mjpeg")
    );
    let (status, head, body) = harness.get_bytes(download_url);
    assert_eq!(status, 200);
    assert!(head.contains("Content-Type: video/x-motion-jpeg"));
    assert!(head.contains(&format!(
        "Content-Disposition: attachment; filename=\"processed_{job_id}_clip.mjpeg\""
    )));
    assert_eq!(body, std::fs::read(&processed).unwrap());
}

#[test]
fn unreadable_upload_still_reaches_full_progress() {
    let harness = Harness::start(Vec::new());
    let (status, body) = harness.request(
        "POST",
        "/upload_video?filename=clip.mp4",
        b"not a video at all",
    );
    assert_eq!(status, 200);
    let job_id = json(&body)["job_id"].as_str().unwrap().to_string();

    assert_eq!(harness.wait_for_percent(&job_id, Duration::from_secs(5)), 100);
    let processed = harness
        .dir
        .path()
        .join("outputs")
        .join(format!("processed_{job_id}_clip.mp4"));
    assert!(!processed.exists());
}

#[test]
fn download_only_serves_processed_outputs() {
    let harness = Harness::start(Vec::new());
    let outputs = harness.dir.path().join("outputs");
    std::fs::write(outputs.join("secret.txt"), b"nope").unwrap();
    std::fs::write(outputs.join("0123_clip.mjpeg"), b"raw upload").unwrap();

    assert_eq!(harness.get("/download").0, 400);
    assert_eq!(harness.get("/download?file=secret.txt").0, 404);
    assert_eq!(harness.get("/download?file=0123_clip.mjpeg").0, 404);
    assert_eq!(
        harness.get("/download?file=processed_..%2Fsecret.mjpeg").0,
        404
    );
    assert_eq!(harness.get("/download?file=processed_missing.mjpeg").0, 404);
    assert_eq!(harness.request("POST", "/download?file=x", b"").0, 405);
}

#[test]
fn upload_requires_filename_and_size_limit() {
    let harness = Harness::start(Vec::new());
    assert_eq!(harness.request("POST", "/upload_video", b"").0, 400);

    let mut stream = harness.connect();
    stream
        .write_all(
            b"POST /upload_video?filename=big.mp4 HTTP/1.1\r\nContent-Length: 999999999\r\n\r\n",
        )
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert_eq!(parse_response(&response).0, 413);
}

#[test]
fn highlight_and_screenshots_reflect_detections() {
    let harness = Harness::start(vec![gun()]);
    let state = harness
        .supervisor
        .start(gunwatch::StreamSource::Url("stub://porch".into()))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (_, body) = harness.get("/api/screenshots");
        if json(&body).as_array().map(Vec::len) == Some(1) {
            let entry = &json(&body)[0];
            let filename = entry["filename"].as_str().unwrap();
            assert!(filename.starts_with("screenshot_url_stub___porch_"));
            assert!(entry["timestamp"].as_str().is_some());
            break;
        }
        assert!(Instant::now() < deadline, "no screenshot written");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(state.last_detection().is_some());

    let (status, head, body) = harness.get_bytes("/api/download_all_screenshots");
    assert_eq!(status, 200);
    assert!(head.contains("Content-Type: application/zip"));
    assert!(head.contains("filename=\"screenshots.zip\""));
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(body)).unwrap();
    assert!(archive.len() >= 1);
    let entry = archive.by_index(0).unwrap();
    assert!(entry.name().starts_with("screenshot_url_stub___porch_"));
    assert!(entry.name().ends_with(".jpg"));
    drop(entry);

    // Only device streams are reported, as 1-based camera numbers.
    let (_, body) = harness.get("/api/trigger_highlight");
    assert_eq!(json(&body)["cameras"], serde_json::json!([]));
}
