//! HTTP/1.1 endpoints for viewers, uploads and status queries.
//!
//! Deliberately small: one thread per connection, `Connection: close` on every
//! response. MJPEG viewers hold their connection for the lifetime of the
//! stream, so the accept loop never serves requests inline.

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::batch::{BatchJob, BatchProcessor, JobId};
use crate::screenshot::ScreenshotStore;
use crate::stream::{StreamSource, StreamSupervisor, MJPEG_BOUNDARY};

const MAX_HEADER_BYTES: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_upload_bytes: u64,
    /// Uploaded inputs and processed outputs land here.
    pub output_dir: PathBuf,
    pub highlight_window: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            max_upload_bytes: 512 * 1024 * 1024,
            output_dir: PathBuf::from("static/outputs"),
            highlight_window: Duration::from_secs(10),
        }
    }
}

/// Everything a request handler may touch.
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<StreamSupervisor>,
    pub processor: Arc<BatchProcessor>,
    pub screenshots: Option<Arc<ScreenshotStore>>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Open viewer connections end when their
    /// stream stops.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        std::fs::create_dir_all(&self.cfg.output_dir).with_context(|| {
            format!("create output dir {}", self.cfg.output_dir.display())
        })?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = Arc::new(self.cfg);
        let state = self.state;
        let join = std::thread::Builder::new()
            .name("api-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, cfg, state, shutdown_thread) {
                    log::error!("api stopped: {}", err);
                }
            })
            .context("spawn api thread")?;

        log::info!("api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    state: ApiState,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let cfg = cfg.clone();
                let state = state.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("api-conn-{}", peer))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &cfg, &state) {
                            log::warn!("api request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("api connection thread spawn failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, state: &ApiState) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let request = read_request(&mut stream)?;
    log::debug!("api {} {}", request.method, request.path);

    let expected_method = match request.path.as_str() {
        "/upload_video" => "POST",
        "/health" | "/video_feed" | "/stop_video" | "/download" | "/api/video_progress"
        | "/api/screenshots" | "/api/download_all_screenshots" | "/api/trigger_highlight"
        | "/api/streams" => "GET",
        _ => return write_json(&mut stream, 404, &json!({"error": "not_found"})),
    };
    if request.method != expected_method {
        return write_json(&mut stream, 405, &json!({"error": "method_not_allowed"}));
    }

    match request.path.as_str() {
        "/health" => write_json(&mut stream, 200, &json!({"status": "ok"})),
        "/video_feed" => video_feed(stream, &request, state),
        "/stop_video" => stop_video(&mut stream, &request, state),
        "/upload_video" => upload_video(&mut stream, request, cfg, state),
        "/download" => download(&mut stream, &request, cfg),
        "/api/video_progress" => video_progress(&mut stream, &request, state),
        "/api/screenshots" => screenshots(&mut stream, state),
        "/api/download_all_screenshots" => screenshot_archive(&mut stream, state),
        "/api/trigger_highlight" => trigger_highlight(&mut stream, cfg, state),
        _ => {
            let streams: Vec<String> = state
                .supervisor
                .active_keys()
                .into_iter()
                .map(|key| key.to_string())
                .collect();
            write_json(&mut stream, 200, &json!({"streams": streams}))
        }
    }
}

fn request_source(request: &HttpRequest) -> Result<StreamSource> {
    StreamSource::from_query(request.query("cam"), request.query("url"))
}

fn video_feed(mut stream: TcpStream, request: &HttpRequest, state: &ApiState) -> Result<()> {
    let source = match request_source(request) {
        Ok(source) => source,
        Err(err) => {
            return write_json(&mut stream, 400, &json!({"error": err.to_string()}));
        }
    };
    let streamer = match state.supervisor.open_stream(source) {
        Ok(streamer) => streamer,
        Err(err) => {
            log::warn!("video feed unavailable: {:#}", err);
            return write_json(&mut stream, 503, &json!({"error": "stream_unavailable"}));
        }
    };

    let key = streamer.state().key().clone();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        MJPEG_BOUNDARY
    );
    stream.write_all(header.as_bytes())?;
    log::info!("viewer attached to stream {}", key);
    let mut parts = 0u64;
    for part in streamer {
        if let Err(err) = stream.write_all(&part) {
            log::debug!("viewer of {} went away: {}", key, err);
            break;
        }
        parts += 1;
    }
    log::info!("viewer detached from stream {} after {} frames", key, parts);
    Ok(())
}

fn stop_video(stream: &mut TcpStream, request: &HttpRequest, state: &ApiState) -> Result<()> {
    let source = match request_source(request) {
        Ok(source) => source,
        Err(err) => return write_json(stream, 400, &json!({"error": err.to_string()})),
    };
    state.supervisor.stop(&source.key());
    write_response(stream, 204, "application/json", &[])
}

fn upload_video(
    stream: &mut TcpStream,
    request: HttpRequest,
    cfg: &ApiConfig,
    state: &ApiState,
) -> Result<()> {
    let Some(filename) = request.query("filename").filter(|f| !f.trim().is_empty()) else {
        return write_json(stream, 400, &json!({"error": "missing_filename"}));
    };
    let Some(length) = request.content_length() else {
        return write_json(stream, 400, &json!({"error": "missing_content_length"}));
    };
    if length > cfg.max_upload_bytes {
        return write_json(stream, 413, &json!({"error": "upload_too_large"}));
    }

    let id = JobId::new_random();
    let output_name = BatchJob::output_name(&id, filename);
    let input = cfg.output_dir.join(BatchJob::upload_name(&id, filename));
    let output = cfg.output_dir.join(&output_name);
    receive_body(stream, &request.body_prefix, length, &input)
        .with_context(|| format!("store upload {}", input.display()))?;
    log::info!(
        "job {}: received {} bytes as {}",
        id,
        length,
        input.display()
    );

    // Visible to pollers before the job thread starts.
    state.processor.progress().publish(&id, 0);
    let processor = state.processor.clone();
    let job_id = id.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("batch-{}", id))
        .spawn(move || match processor.process_file(job_id.clone(), &input, &output) {
            Ok(report) => log::info!(
                "job {}: {} frames, {} with detections, output {}",
                job_id,
                report.frames_processed,
                report.frames_with_detections,
                report.output_path.display()
            ),
            Err(err) => log::error!("job {}: failed: {:#}", job_id, err),
        });
    if let Err(err) = spawned {
        state.processor.progress().clear(&id);
        return Err(anyhow::Error::new(err).context("spawn batch thread"));
    }

    write_json(
        stream,
        200,
        &json!({
            "job_id": id.as_str(),
            "success": true,
            "download_url": format!("/download?file={}", output_name),
        }),
    )
}

fn receive_body(
    stream: &mut TcpStream,
    prefix: &[u8],
    length: u64,
    path: &std::path::Path,
) -> Result<()> {
    let mut file = File::create(path)?;
    let head = &prefix[..prefix.len().min(length as usize)];
    file.write_all(head)?;
    let mut remaining = length - head.len() as u64;
    let mut buf = vec![0u8; UPLOAD_CHUNK];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = stream.read(&mut buf[..want])?;
        if n == 0 {
            drop(file);
            let _ = std::fs::remove_file(path);
            return Err(anyhow!("upload ended {} bytes early", remaining));
        }
        file.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    file.flush()?;
    Ok(())
}

fn download(stream: &mut TcpStream, request: &HttpRequest, cfg: &ApiConfig) -> Result<()> {
    let Some(name) = request.query("file") else {
        return write_json(stream, 400, &json!({"error": "missing_file"}));
    };
    if !BatchJob::is_output_name(name) {
        return write_json(stream, 404, &json!({"error": "not_found"}));
    }
    let path = cfg.output_dir.join(name);
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return write_json(stream, 404, &json!({"error": "not_found"}));
        }
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    let len = file.metadata()?.len();
    write_head(
        stream,
        200,
        "video/x-motion-jpeg",
        len,
        &[("Content-Disposition", format!("attachment; filename=\"{}\"", name))],
    )?;
    std::io::copy(&mut file, stream)?;
    stream.flush()?;
    log::info!("download {} ({} bytes)", name, len);
    Ok(())
}

fn screenshot_archive(stream: &mut TcpStream, state: &ApiState) -> Result<()> {
    let Some(store) = &state.screenshots else {
        return write_json(stream, 404, &json!({"error": "screenshots_disabled"}));
    };
    let archive = match store.archive() {
        Ok(archive) => archive,
        Err(err) => {
            log::error!("screenshot archive failed: {:#}", err);
            return write_json(stream, 500, &json!({"error": "screenshot_archive_failed"}));
        }
    };
    write_head(
        stream,
        200,
        "application/zip",
        archive.len() as u64,
        &[(
            "Content-Disposition",
            "attachment; filename=\"screenshots.zip\"".to_string(),
        )],
    )?;
    stream.write_all(&archive)?;
    stream.flush()?;
    Ok(())
}

fn video_progress(stream: &mut TcpStream, request: &HttpRequest, state: &ApiState) -> Result<()> {
    let Some(raw) = request.query("job_id").filter(|id| !id.is_empty()) else {
        return write_json(stream, 200, &json!({"percent": 0}));
    };
    let id: JobId = match raw.parse() {
        Ok(id) => id,
        Err(_) => return write_json(stream, 400, &json!({"error": "invalid_job_id"})),
    };
    let percent = state.processor.progress().get(&id);
    write_json(stream, 200, &json!({"percent": percent}))
}

fn screenshots(stream: &mut TcpStream, state: &ApiState) -> Result<()> {
    let entries = match &state.screenshots {
        Some(store) => match store.list() {
            Ok(entries) => entries,
            Err(err) => {
                log::error!("screenshot listing failed: {:#}", err);
                return write_json(stream, 500, &json!({"error": "screenshot_listing_failed"}));
            }
        },
        None => Vec::new(),
    };
    let payload = serde_json::to_vec(&entries)?;
    write_response(stream, 200, "application/json", &payload)
}

fn trigger_highlight(stream: &mut TcpStream, cfg: &ApiConfig, state: &ApiState) -> Result<()> {
    let cameras: Vec<u32> = state
        .supervisor
        .active_streams_with_recent_detection(cfg.highlight_window, Instant::now())
        .iter()
        .filter_map(|key| key.device_index())
        .map(|index| index + 1)
        .collect();
    write_json(stream, 200, &json!({"cameras": cameras}))
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request header too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };
    let body_prefix = data[header_end + 4..].to_vec();
    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers,
        body_prefix,
    })
}

fn write_json(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    write_head(stream, status, content_type, body.len() as u64, &[])?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

fn write_head(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    len: u64,
    extra_headers: &[(&str, String)],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = content_type,
        len = len
    );
    for (name, value) in extra_headers {
        header.push_str(&format!("{}: {}\r\n", name, value));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    /// Body bytes that arrived with the header block.
    body_prefix: Vec<u8>,
}

impl HttpRequest {
    fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    fn content_length(&self) -> Option<u64> {
        self.headers
            .get("content-length")
            .and_then(|value| value.parse().ok())
    }
}
