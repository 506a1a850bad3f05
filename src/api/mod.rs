//! HTTP endpoint layer.
//!
//! A deliberately small HTTP/1.1 server over `std::net`: one accept loop on
//! a dedicated thread, one connection handled at a time, JSON bodies in and
//! out. Frames arrive as multipart/form-data uploads.

pub mod multipart;

use crate::config::{DetectorSettings, ProctordConfig};
use crate::detect::{BackendRegistry, DetectionCapability, FaceBox};
use crate::pose::{HeadPose, PoseEstimator, PoseThresholds, NO_FACE_LABEL};
use crate::storage::{AlertRecord, ProctorStore, SqliteProctorStore};
use crate::{hash_password, now_s, EnrollmentRegistry, RgbFrame};
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Uploaded frames are whole webcam captures; cap requests at 8 MiB.
const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8811".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
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
    app_cfg: ProctordConfig,
    registry: BackendRegistry,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, app_cfg: ProctordConfig, registry: BackendRegistry) -> Self {
        Self {
            cfg,
            app_cfg,
            registry,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let app_cfg = self.app_cfg;
        let registry = self.registry;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, app_cfg, registry, shutdown_thread) {
                log::error!("proctor api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct EndpointContext {
    store: Box<dyn ProctorStore + Send>,
    enrollment: EnrollmentRegistry,
    estimator: PoseEstimator,
    registry: BackendRegistry,
    detector: DetectorSettings,
    position_margin: f64,
}

fn run_api(
    listener: TcpListener,
    app_cfg: ProctordConfig,
    registry: BackendRegistry,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let store = SqliteProctorStore::open(&app_cfg.db_path)?;
    let mut ctx = EndpointContext {
        store: Box::new(store),
        enrollment: EnrollmentRegistry::new(),
        estimator: PoseEstimator::new(PoseThresholds {
            yaw: app_cfg.pose.yaw_threshold,
            pitch: app_cfg.pose.pitch_threshold,
            roll: app_cfg.pose.roll_threshold,
        }),
        registry,
        detector: app_cfg.detector.clone(),
        position_margin: app_cfg.pose.position_margin,
    };

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &mut ctx) {
                    log::warn!("proctor api request rejected: {}", err);
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

fn handle_connection(mut stream: TcpStream, ctx: &mut EndpointContext) -> Result<()> {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            // Best effort; the peer may already be gone.
            let _ = write_json_response(&mut stream, 400, &json!({"error": "bad_request"}));
            return Err(err);
        }
    };
    let (status, body) = match dispatch(&request, ctx) {
        Ok(response) => response,
        Err(err) => {
            log::warn!(
                "endpoint {} {} failed: {}",
                request.method,
                request.path,
                err
            );
            (500, json!({"error": "internal_error"}))
        }
    };
    write_json_response(&mut stream, status, &body)
}

fn dispatch(request: &HttpRequest, ctx: &mut EndpointContext) -> Result<(u16, Value)> {
    match request.path.as_str() {
        "/health" => expect_get(request, |_| Ok((200, json!({"status": "ok"}))), ctx),
        "/login" => expect_post(request, ctx, login),
        "/log-alert" => expect_post(request, ctx, log_alert),
        "/alerts" => expect_get(request, |ctx| alerts(ctx), ctx),
        "/registered-faces" => expect_get(request, registered_faces, ctx),
        "/test-head-detection" => expect_get(request, test_head_detection, ctx),
        "/detect-head" => expect_post(request, ctx, detect_head),
        "/simple-head-detection" => expect_post(request, ctx, simple_head_detection),
        "/register-face" => expect_post(request, ctx, register_face),
        "/verify-face" => expect_post(request, ctx, verify_face),
        "/detect-object" => expect_post(request, ctx, detect_object),
        _ => Ok((404, json!({"error": "not_found"}))),
    }
}

fn expect_get(
    request: &HttpRequest,
    handler: impl FnOnce(&mut EndpointContext) -> Result<(u16, Value)>,
    ctx: &mut EndpointContext,
) -> Result<(u16, Value)> {
    if request.method != "GET" {
        return Ok((405, json!({"error": "method_not_allowed"})));
    }
    handler(ctx)
}

fn expect_post(
    request: &HttpRequest,
    ctx: &mut EndpointContext,
    handler: impl FnOnce(&HttpRequest, &mut EndpointContext) -> Result<(u16, Value)>,
) -> Result<(u16, Value)> {
    if request.method != "POST" {
        return Ok((405, json!({"error": "method_not_allowed"})));
    }
    handler(request, ctx)
}

// ----------------------------------------------------------------------------
// Endpoint handlers
// ----------------------------------------------------------------------------

fn login(request: &HttpRequest, ctx: &mut EndpointContext) -> Result<(u16, Value)> {
    let Ok(payload) = serde_json::from_slice::<Value>(&request.body) else {
        return Ok((400, json!({"message": "No JSON data received"})));
    };
    let username = payload["username"].as_str().unwrap_or_default();
    let roll_number = payload["rollNumber"].as_str().unwrap_or_default();
    let password = payload["password"].as_str().unwrap_or_default();

    let matched =
        ctx.store
            .verify_credentials(username, roll_number, &hash_password(password))?;
    if matched {
        Ok((200, json!({"message": "Login successful"})))
    } else {
        Ok((200, json!({"message": "Invalid credentials"})))
    }
}

fn log_alert(request: &HttpRequest, ctx: &mut EndpointContext) -> Result<(u16, Value)> {
    let Ok(payload) = serde_json::from_slice::<Value>(&request.body) else {
        return Ok((400, json!({"status": "error", "message": "Missing data"})));
    };
    let student_id = payload["student_id"].as_str().unwrap_or_default();
    let direction = payload["direction"].as_str().unwrap_or_default();
    let time = payload["time"].as_str().unwrap_or_default();
    if student_id.is_empty() || direction.is_empty() || time.is_empty() {
        return Ok((400, json!({"status": "error", "message": "Missing data"})));
    }

    let record = AlertRecord {
        student_id: student_id.to_string(),
        direction: direction.to_string(),
        alert_time: now_s()? as i64,
        details: payload.clone(),
    };
    ctx.store.insert_alert(&record)?;
    log::info!("alert logged for student {}: {}", student_id, direction);
    Ok((200, json!({"status": "ok"})))
}

fn alerts(ctx: &mut EndpointContext) -> Result<(u16, Value)> {
    let alerts = ctx.store.list_alerts(usize::MAX)?;
    Ok((200, serde_json::to_value(alerts)?))
}

fn registered_faces(ctx: &mut EndpointContext) -> Result<(u16, Value)> {
    Ok((200, json!({"registered_faces": ctx.enrollment.list()?})))
}

fn test_head_detection(ctx: &mut EndpointContext) -> Result<(u16, Value)> {
    Ok((
        200,
        json!({
            "status": "Head detection system is running",
            "face_backend_available": ctx.registry.serves(DetectionCapability::FaceDetection),
            "landmark_backend_available": ctx.registry.serves(DetectionCapability::FaceLandmarks),
            "registered_faces_count": ctx.enrollment.len()?,
            "registered_faces": ctx.enrollment.list()?,
        }),
    ))
}

fn detect_head(request: &HttpRequest, ctx: &mut EndpointContext) -> Result<(u16, Value)> {
    let frame = match uploaded_frame(request)? {
        Ok(frame) => frame,
        Err(response) => return Ok(response),
    };
    if !ctx.registry.serves(DetectionCapability::FaceLandmarks) {
        return Ok((503, json!({"error": "backend_unavailable"})));
    }
    let landmarks = ctx
        .registry
        .face_landmarks(frame.pixels(), frame.width, frame.height)?;
    let Some(landmarks) = landmarks else {
        return Ok((200, no_face_response()));
    };
    let image_points = landmarks.pose_points(frame.width, frame.height)?;
    let pose = ctx
        .estimator
        .estimate(&image_points, frame.width, frame.height)?;
    let direction = ctx.estimator.classify(&pose);
    Ok((200, pose_response(direction.label(), &pose)))
}

fn simple_head_detection(request: &HttpRequest, ctx: &mut EndpointContext) -> Result<(u16, Value)> {
    let frame = match uploaded_frame(request)? {
        Ok(frame) => frame,
        Err(response) => return Ok(response),
    };
    if !ctx.registry.serves(DetectionCapability::FaceDetection) {
        return Ok((503, json!({"error": "backend_unavailable"})));
    }
    let faces = ctx
        .registry
        .detect_faces(frame.pixels(), frame.width, frame.height)?;
    let Some(face) = primary_face(&faces) else {
        return Ok((200, no_face_response()));
    };
    let (center_x, center_y) = face.center();
    let (direction, pose) = ctx
        .estimator
        .position_heuristic(center_x, center_y, ctx.position_margin);
    log::debug!(
        "simple head detection: center ({:.2}, {:.2}) -> {}",
        center_x,
        center_y,
        direction.label()
    );
    Ok((200, pose_response(direction.label(), &pose)))
}

fn register_face(request: &HttpRequest, ctx: &mut EndpointContext) -> Result<(u16, Value)> {
    let (roll_number, frame) = match enrollment_upload(request)? {
        Ok(pair) => pair,
        Err(response) => return Ok(response),
    };
    if !ctx.registry.serves(DetectionCapability::FaceDetection) {
        return Ok((503, json!({"error": "backend_unavailable"})));
    }
    let faces = ctx
        .registry
        .detect_faces(frame.pixels(), frame.width, frame.height)?;
    match faces.len() {
        0 => Ok((200, json!({"status": "no_face"}))),
        1 => {
            ctx.enrollment.register(&roll_number)?;
            log::info!("face registered for roll number {}", roll_number);
            Ok((200, json!({"status": "registered"})))
        }
        _ => Ok((200, json!({"status": "multiple_faces"}))),
    }
}

fn verify_face(request: &HttpRequest, ctx: &mut EndpointContext) -> Result<(u16, Value)> {
    let (roll_number, frame) = match enrollment_upload(request)? {
        Ok(pair) => pair,
        Err(response) => return Ok(response),
    };
    if !ctx.registry.serves(DetectionCapability::FaceDetection) {
        return Ok((503, json!({"error": "backend_unavailable"})));
    }
    let faces = ctx
        .registry
        .detect_faces(frame.pixels(), frame.width, frame.height)?;
    match faces.len() {
        0 => Ok((200, json!({"status": "no_face"}))),
        1 => {
            // Presence check only: a face plus prior enrollment counts as a
            // match. Embedding-based recognition is out of scope.
            if ctx.enrollment.contains(&roll_number)? {
                Ok((200, json!({"status": "match"})))
            } else {
                Ok((200, json!({"status": "mismatch"})))
            }
        }
        _ => Ok((200, json!({"status": "multiple_faces"}))),
    }
}

fn detect_object(request: &HttpRequest, ctx: &mut EndpointContext) -> Result<(u16, Value)> {
    let frame = match uploaded_frame(request)? {
        Ok(frame) => frame,
        Err(response) => return Ok(response),
    };
    if !ctx.registry.serves(DetectionCapability::ObjectDetection) {
        return Ok((503, json!({"error": "backend_unavailable"})));
    }
    let detections = ctx
        .registry
        .detect_objects(frame.pixels(), frame.width, frame.height)?;
    let forbidden: Vec<String> = detections
        .iter()
        .filter(|d| d.confidence > ctx.detector.confidence_threshold)
        .filter(|d| ctx.detector.forbidden_labels.iter().any(|l| l == &d.label))
        .map(|d| d.label.clone())
        .collect();

    if forbidden.is_empty() {
        Ok((200, json!({"status": "clear"})))
    } else {
        log::info!("forbidden objects detected: {:?}", forbidden);
        Ok((
            200,
            json!({"status": "forbidden_object", "objects": forbidden}),
        ))
    }
}

// ----------------------------------------------------------------------------
// Upload helpers
// ----------------------------------------------------------------------------

type UploadOutcome<T> = Result<std::result::Result<T, (u16, Value)>>;

fn multipart_parts(request: &HttpRequest) -> std::result::Result<Vec<multipart::MultipartPart>, (u16, Value)> {
    let Some(content_type) = request.headers.get("content-type") else {
        return Err((400, json!({"error": "expected_multipart"})));
    };
    let Some(boundary) = multipart::boundary_from_content_type(content_type) else {
        return Err((400, json!({"error": "expected_multipart"})));
    };
    multipart::parse(&request.body, &boundary)
        .map_err(|_| (400, json!({"error": "malformed_multipart"})))
}

fn uploaded_frame(request: &HttpRequest) -> UploadOutcome<RgbFrame> {
    let parts = match multipart_parts(request) {
        Ok(parts) => parts,
        Err(response) => return Ok(Err(response)),
    };
    let Some(image) = multipart::field(&parts, "image") else {
        return Ok(Err((400, json!({"error": "missing_image"}))));
    };
    match RgbFrame::decode(&image.data) {
        Ok(frame) => Ok(Ok(frame)),
        Err(err) => {
            log::warn!("frame decode failed: {}", err);
            Ok(Err((400, json!({"error": "invalid_image"}))))
        }
    }
}

fn enrollment_upload(request: &HttpRequest) -> UploadOutcome<(String, RgbFrame)> {
    let parts = match multipart_parts(request) {
        Ok(parts) => parts,
        Err(response) => return Ok(Err(response)),
    };
    let Some(roll) = multipart::field(&parts, "roll_number") else {
        return Ok(Err((400, json!({"error": "missing_roll_number"}))));
    };
    let roll_number = String::from_utf8_lossy(&roll.data).trim().to_string();
    if roll_number.is_empty() {
        return Ok(Err((400, json!({"error": "missing_roll_number"}))));
    }
    let Some(image) = multipart::field(&parts, "image") else {
        return Ok(Err((400, json!({"error": "missing_image"}))));
    };
    match RgbFrame::decode(&image.data) {
        Ok(frame) => Ok(Ok((roll_number, frame))),
        Err(err) => {
            log::warn!("frame decode failed: {}", err);
            Ok(Err((400, json!({"error": "invalid_image"}))))
        }
    }
}

fn primary_face(faces: &[FaceBox]) -> Option<&FaceBox> {
    faces
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

fn no_face_response() -> Value {
    pose_response(NO_FACE_LABEL, &HeadPose::default())
}

fn pose_response(direction: &str, pose: &HeadPose) -> Value {
    json!({
        "direction": direction,
        "yaw": pose.yaw,
        "pitch": pose.pitch,
        "roll": pose.roll,
    })
}

// ----------------------------------------------------------------------------
// HTTP plumbing
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let header_text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = header_text.split("\r\n");
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

    let content_length: usize = headers
        .get("content-length")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| anyhow!("invalid content-length"))?
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}
