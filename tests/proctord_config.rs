use std::sync::Mutex;

use tempfile::NamedTempFile;

use proctord::config::ProctordConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PROCTOR_CONFIG",
        "PROCTOR_API_ADDR",
        "PROCTOR_DB_PATH",
        "PROCTOR_DETECTOR_BACKEND",
        "PROCTOR_FORBIDDEN_LABELS",
        "PROCTOR_CONFIDENCE_THRESHOLD",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_apply_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ProctordConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "proctor.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:8811");
    assert_eq!(cfg.pose.yaw_threshold, 30.0);
    assert_eq!(cfg.pose.pitch_threshold, 20.0);
    assert_eq!(cfg.pose.roll_threshold, 30.0);
    assert_eq!(cfg.pose.position_margin, 0.3);
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.detector.confidence_threshold, 0.5);
    assert_eq!(cfg.detector.forbidden_labels, vec!["cell phone", "laptop"]);
    assert!(cfg.detector.object_model.is_none());

    clear_env();
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let toml = r#"
        db_path = "proctor_prod.db"

        [api]
        addr = "0.0.0.0:9000"

        [pose]
        yaw_threshold = 25.0
        position_margin = 0.2

        [detector]
        backend = "tract"
        confidence_threshold = 0.6
        forbidden_labels = ["cell phone", "book"]
        object_model = "models/yolov5s.onnx"
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("PROCTOR_CONFIG", file.path());
    std::env::set_var("PROCTOR_DB_PATH", "proctor_override.db");
    std::env::set_var("PROCTOR_FORBIDDEN_LABELS", "cell phone, tablet");

    let cfg = ProctordConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "proctor_override.db");
    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.pose.yaw_threshold, 25.0);
    assert_eq!(cfg.pose.pitch_threshold, 20.0);
    assert_eq!(cfg.pose.position_margin, 0.2);
    assert_eq!(cfg.detector.backend, "tract");
    assert_eq!(cfg.detector.confidence_threshold, 0.6);
    assert_eq!(cfg.detector.forbidden_labels, vec!["cell phone", "tablet"]);
    assert_eq!(cfg.detector.object_model.as_deref(), Some("models/yolov5s.onnx"));

    clear_env();
}

#[test]
fn rejects_unknown_backend_and_bad_thresholds() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PROCTOR_DETECTOR_BACKEND", "opencv");
    assert!(ProctordConfig::load().is_err());
    clear_env();

    std::env::set_var("PROCTOR_CONFIDENCE_THRESHOLD", "1.5");
    assert!(ProctordConfig::load().is_err());
    clear_env();

    std::env::set_var("PROCTOR_CONFIDENCE_THRESHOLD", "not a number");
    assert!(ProctordConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"[pose]\nposition_margin = 0.5\n")
        .expect("write config");
    std::env::set_var("PROCTOR_CONFIG", file.path());
    assert!(ProctordConfig::load().is_err());
    clear_env();
}
