use anyhow::Result;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::TcpStream;
use tempfile::tempdir;

use proctord::api::{ApiConfig, ApiHandle, ApiServer};
use proctord::detect::{BackendRegistry, Detection, FaceBox, FaceLandmarks, StubBackend};
use proctord::{hash_password, ProctorStore, ProctordConfig, SqliteProctorStore};

struct TestApi {
    _dir: tempfile::TempDir,
    db_path: String,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(registry: BackendRegistry) -> Result<Self> {
        Self::with_setup(registry, |_| Ok(()))
    }

    fn with_setup(
        registry: BackendRegistry,
        setup: impl FnOnce(&mut SqliteProctorStore) -> Result<()>,
    ) -> Result<Self> {
        let dir = tempdir()?;
        let db_path = dir.path().join("proctor.db").to_string_lossy().to_string();
        {
            let mut store = SqliteProctorStore::open(&db_path)?;
            setup(&mut store)?;
        }

        let mut app_cfg = ProctordConfig::default();
        app_cfg.db_path = db_path.clone();

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        };
        let api_handle = ApiServer::new(api_config, app_cfg, registry).spawn()?;

        Ok(Self {
            _dir: dir,
            db_path,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn get(&self, path: &str) -> Result<(u16, Value)> {
        self.request("GET", path, None, &[])
    }

    fn post_json(&self, path: &str, payload: &Value) -> Result<(u16, Value)> {
        self.request(
            "POST",
            path,
            Some("application/json"),
            payload.to_string().as_bytes(),
        )
    }

    fn post_multipart(&self, path: &str, body: &[u8]) -> Result<(u16, Value)> {
        self.request(
            "POST",
            path,
            Some("multipart/form-data; boundary=testboundary"),
            body,
        )
    }

    fn request(
        &self,
        method: &str,
        path: &str,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<(u16, Value)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n");
        if let Some(content_type) = content_type {
            request.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        request.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        stream.write_all(request.as_bytes())?;
        stream.write_all(body)?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        let response = String::from_utf8_lossy(&response).to_string();
        let mut parts = response.splitn(2, "\r\n\r\n");
        let headers = parts.next().unwrap_or("").to_string();
        let body = parts.next().unwrap_or("").to_string();
        let status: u16 = headers
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status code in response");
        let value: Value = serde_json::from_str(&body)?;
        Ok((status, value))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
    }
}

fn face(x: f32, y: f32, w: f32, h: f32) -> FaceBox {
    FaceBox {
        x,
        y,
        w,
        h,
        confidence: 0.9,
    }
}

fn object(label: &str, confidence: f32) -> Detection {
    Detection {
        x: 0.1,
        y: 0.1,
        w: 0.3,
        h: 0.3,
        confidence,
        label: label.to_string(),
    }
}

/// Landmarks projected from the rigid face model for a frontal head at
/// (0, 0, 900) mm in a 640x480 frame. The PnP solve recovers near-zero
/// angles for these.
fn frontal_landmarks() -> FaceLandmarks {
    let mut points = vec![(0.0f32, 0.0f32); 468];
    points[1] = (0.5, 0.5); // nose tip
    points[152] = (0.5, 0.955_958_5); // chin
    points[263] = (0.282_608_7, 0.280_998_4); // left eye outer corner
    points[33] = (0.717_391_3, 0.280_998_4); // right eye outer corner
    points[287] = (0.353_658_5, 0.695_122_0); // left mouth corner
    points[57] = (0.646_341_5, 0.695_122_0); // right mouth corner
    FaceLandmarks { points }
}

fn registry_with(backend: StubBackend) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(backend);
    registry
}

fn png_frame() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(640, 480, image::Rgb([90, 120, 150]));
    let mut encoded = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(
            &mut std::io::Cursor::new(&mut encoded),
            image::ImageFormat::Png,
        )
        .expect("png encode");
    encoded
}

fn multipart_image(extra_fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in extra_fields {
        body.extend_from_slice(
            format!(
                "--testboundary\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        b"--testboundary\r\nContent-Disposition: form-data; name=\"image\"; filename=\"frame.png\"\r\nContent-Type: image/png\r\n\r\n",
    );
    body.extend_from_slice(&png_frame());
    body.extend_from_slice(b"\r\n--testboundary--\r\n");
    body
}

#[test]
fn health_endpoint_responds() -> Result<()> {
    let api = TestApi::new(registry_with(StubBackend::new()))?;
    let (status, body) = api.get("/health")?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[test]
fn unknown_path_and_wrong_method() -> Result<()> {
    let api = TestApi::new(registry_with(StubBackend::new()))?;
    let (status, _) = api.get("/nope")?;
    assert_eq!(status, 404);
    let (status, _) = api.get("/detect-object")?;
    assert_eq!(status, 405);
    let (status, _) = api.post_json("/alerts", &json!({}))?;
    assert_eq!(status, 405);
    Ok(())
}

fn raw_request(api: &TestApi, request: &str) -> Result<String> {
    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.write_all(request.as_bytes())?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    Ok(String::from_utf8_lossy(&response).to_string())
}

#[test]
fn oversized_upload_is_refused() -> Result<()> {
    let api = TestApi::new(registry_with(StubBackend::new()))?;

    // Declared body larger than the 8 MiB request cap; the server must
    // refuse before reading it.
    let declared = 9 * 1024 * 1024;
    let response = raw_request(
        &api,
        &format!(
            "POST /detect-object HTTP/1.1\r\n\
             Host: localhost\r\n\
             Content-Type: multipart/form-data; boundary=testboundary\r\n\
             Content-Length: {declared}\r\n\r\n"
        ),
    )?;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.contains("bad_request"), "{response}");

    // A well-formed small request still succeeds afterwards.
    let (status, _) = api.get("/health")?;
    assert_eq!(status, 200);
    Ok(())
}

#[test]
fn unparseable_content_length_is_refused() -> Result<()> {
    let api = TestApi::new(registry_with(StubBackend::new()))?;
    let response = raw_request(
        &api,
        "POST /login HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Length: not-a-number\r\n\r\n",
    )?;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.contains("bad_request"), "{response}");
    Ok(())
}

#[test]
fn login_checks_credentials() -> Result<()> {
    let api = TestApi::with_setup(registry_with(StubBackend::new()), |store| {
        store.add_student("ada", "42", &hash_password("pw"))
    })?;

    let (status, body) = api.post_json(
        "/login",
        &json!({"username": "ada", "rollNumber": "42", "password": "pw"}),
    )?;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Login successful");

    let (status, body) = api.post_json(
        "/login",
        &json!({"username": "ada", "rollNumber": "42", "password": "wrong"}),
    )?;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Invalid credentials");

    let (status, body) = api.request("POST", "/login", Some("application/json"), b"not json")?;
    assert_eq!(status, 400);
    assert_eq!(body["message"], "No JSON data received");
    Ok(())
}

#[test]
fn alerts_roundtrip_newest_first() -> Result<()> {
    let api = TestApi::new(registry_with(StubBackend::new()))?;

    let (status, body) = api.post_json(
        "/log-alert",
        &json!({"student_id": "42", "direction": "ALERT: Looking Left", "time": "10:00:00"}),
    )?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let (status, _) = api.post_json(
        "/log-alert",
        &json!({"student_id": "7", "direction": "ALERT: Looking Down", "time": "10:00:05"}),
    )?;
    assert_eq!(status, 200);

    let (status, body) = api.get("/alerts")?;
    assert_eq!(status, 200);
    let alerts = body.as_array().expect("alerts array");
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0]["student_id"], "7");
    assert_eq!(alerts[1]["student_id"], "42");
    assert_eq!(alerts[1]["details"]["time"], "10:00:00");

    let (status, body) = api.post_json("/log-alert", &json!({"student_id": "42"}))?;
    assert_eq!(status, 400);
    assert_eq!(body["message"], "Missing data");
    Ok(())
}

#[test]
fn register_then_verify_matches() -> Result<()> {
    let backend = StubBackend::new().with_faces(vec![face(0.4, 0.4, 0.2, 0.3)]);
    let api = TestApi::new(registry_with(backend))?;

    let (status, body) = api.get("/registered-faces")?;
    assert_eq!(status, 200);
    assert_eq!(body["registered_faces"], json!([]));

    let upload = multipart_image(&[("roll_number", "42")]);
    let (status, body) = api.post_multipart("/register-face", &upload)?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "registered");

    let (status, body) = api.post_multipart("/verify-face", &upload)?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "match");

    let other = multipart_image(&[("roll_number", "99")]);
    let (status, body) = api.post_multipart("/verify-face", &other)?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "mismatch");

    let (status, body) = api.get("/registered-faces")?;
    assert_eq!(status, 200);
    assert_eq!(body["registered_faces"], json!(["42"]));

    let (status, body) = api.get("/test-head-detection")?;
    assert_eq!(status, 200);
    assert_eq!(body["registered_faces_count"], 1);
    assert_eq!(body["face_backend_available"], true);
    Ok(())
}

#[test]
fn enrollment_requires_exactly_one_face() -> Result<()> {
    let upload = multipart_image(&[("roll_number", "42")]);

    let none = TestApi::new(registry_with(StubBackend::new()))?;
    let (status, body) = none.post_multipart("/register-face", &upload)?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "no_face");

    let crowd = StubBackend::new().with_faces(vec![
        face(0.1, 0.1, 0.2, 0.2),
        face(0.6, 0.1, 0.2, 0.2),
    ]);
    let crowd = TestApi::new(registry_with(crowd))?;
    let (status, body) = crowd.post_multipart("/register-face", &upload)?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "multiple_faces");
    Ok(())
}

#[test]
fn missing_upload_fields_are_rejected() -> Result<()> {
    let api = TestApi::new(registry_with(StubBackend::new()))?;

    let no_roll = multipart_image(&[]);
    let (status, body) = api.post_multipart("/register-face", &no_roll)?;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "missing_roll_number");

    let (status, body) = api.request("POST", "/detect-object", Some("application/json"), b"{}")?;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "expected_multipart");

    let mut garbage_image = Vec::new();
    garbage_image.extend_from_slice(
        b"--testboundary\r\nContent-Disposition: form-data; name=\"image\"\r\n\r\nnot an image\r\n--testboundary--\r\n",
    );
    let (status, body) = api.post_multipart("/detect-object", &garbage_image)?;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_image");
    Ok(())
}

#[test]
fn object_detection_filters_forbidden_labels() -> Result<()> {
    let backend = StubBackend::new().with_objects(vec![
        object("cell phone", 0.92),
        object("book", 0.88),
        object("laptop", 0.3), // below the confidence threshold
    ]);
    let api = TestApi::new(registry_with(backend))?;

    let upload = multipart_image(&[]);
    let (status, body) = api.post_multipart("/detect-object", &upload)?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "forbidden_object");
    assert_eq!(body["objects"], json!(["cell phone"]));

    let clear = TestApi::new(registry_with(
        StubBackend::new().with_objects(vec![object("book", 0.9)]),
    ))?;
    let (status, body) = clear.post_multipart("/detect-object", &upload)?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "clear");
    Ok(())
}

#[test]
fn capability_gap_maps_to_unavailable() -> Result<()> {
    let api = TestApi::new(BackendRegistry::new())?;
    let upload = multipart_image(&[]);
    let (status, body) = api.post_multipart("/detect-object", &upload)?;
    assert_eq!(status, 503);
    assert_eq!(body["error"], "backend_unavailable");
    Ok(())
}

#[test]
fn simple_head_detection_uses_face_position() -> Result<()> {
    let left = TestApi::new(registry_with(
        StubBackend::new().with_faces(vec![face(0.0, 0.4, 0.1, 0.2)]),
    ))?;
    let upload = multipart_image(&[]);
    let (status, body) = left.post_multipart("/simple-head-detection", &upload)?;
    assert_eq!(status, 200);
    assert_eq!(body["direction"], "ALERT: Looking Left");
    assert_eq!(body["yaw"], -30.0);

    let centered = TestApi::new(registry_with(
        StubBackend::new().with_faces(vec![face(0.4, 0.4, 0.2, 0.2)]),
    ))?;
    let (status, body) = centered.post_multipart("/simple-head-detection", &upload)?;
    assert_eq!(status, 200);
    assert_eq!(body["direction"], "Looking Forward");

    let empty = TestApi::new(registry_with(StubBackend::new()))?;
    let (status, body) = empty.post_multipart("/simple-head-detection", &upload)?;
    assert_eq!(status, 200);
    assert_eq!(body["direction"], "No face detected");
    Ok(())
}

#[test]
fn detect_head_classifies_frontal_pose() -> Result<()> {
    let backend = StubBackend::new()
        .with_faces(vec![face(0.3, 0.3, 0.4, 0.4)])
        .with_landmarks(frontal_landmarks());
    let api = TestApi::new(registry_with(backend))?;

    let upload = multipart_image(&[]);
    let (status, body) = api.post_multipart("/detect-head", &upload)?;
    assert_eq!(status, 200);
    assert_eq!(body["direction"], "Looking Forward");
    assert!(body["yaw"].as_f64().unwrap().abs() < 1.0);
    assert!(body["pitch"].as_f64().unwrap().abs() < 1.0);
    assert!(body["roll"].as_f64().unwrap().abs() < 1.0);

    let no_landmarks = TestApi::new(registry_with(StubBackend::new()))?;
    let (status, body) = no_landmarks.post_multipart("/detect-head", &upload)?;
    assert_eq!(status, 200);
    assert_eq!(body["direction"], "No face detected");
    assert_eq!(body["yaw"], 0.0);
    Ok(())
}

#[test]
fn alerts_survive_api_restart_but_enrollment_does_not() -> Result<()> {
    let backend = || StubBackend::new().with_faces(vec![face(0.4, 0.4, 0.2, 0.2)]);
    let mut api = TestApi::new(registry_with(backend()))?;

    api.post_json(
        "/log-alert",
        &json!({"student_id": "42", "direction": "ALERT: Looking Up", "time": "09:00:00"}),
    )?;
    let upload = multipart_image(&[("roll_number", "42")]);
    let (_, body) = api.post_multipart("/register-face", &upload)?;
    assert_eq!(body["status"], "registered");

    // Stop the first server, then point a fresh one at the same database.
    api.api_handle
        .take()
        .expect("first server handle")
        .stop()?;
    let mut registry = BackendRegistry::new();
    registry.register(backend());
    let mut app_cfg = ProctordConfig::default();
    app_cfg.db_path = api.db_path.clone();
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        app_cfg,
        registry,
    )
    .spawn()?;
    api.api_handle = Some(handle);

    // Alerts persist across restarts; enrollment is in-process only.
    let (_, body) = api.get("/alerts")?;
    assert_eq!(body.as_array().expect("alerts array").len(), 1);
    let (_, body) = api.get("/registered-faces")?;
    assert_eq!(body["registered_faces"], json!([]));
    Ok(())
}
