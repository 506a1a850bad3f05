//! proctord - proctoring-assistance API daemon
//!
//! This daemon:
//! 1. Opens the alert/credential database (bootstrapping the schema)
//! 2. Registers detector backends per configuration
//! 3. Serves the proctoring HTTP API
//! 4. Shuts down on Ctrl-C

use anyhow::Result;
use std::sync::mpsc;

use proctord::api::{ApiConfig, ApiServer};
use proctord::detect::{BackendRegistry, StubBackend};
use proctord::{ProctordConfig, ProctorStore, SqliteProctorStore};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ProctordConfig::load()?;

    // Startup connectivity check, mirrored in the logs so a misconfigured
    // database path is obvious before the first request.
    {
        let mut store = SqliteProctorStore::open(&config.db_path)?;
        log::info!(
            "database '{}' ready: {} students, {} alerts",
            config.db_path,
            store.student_count()?,
            store.alert_count()?
        );
    }

    let registry = build_registry(&config)?;
    registry.warm_up()?;
    log::info!("detector backends registered: {:?}", registry.list());

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, config, registry).spawn()?;
    log::info!("proctor api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("proctord waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    Ok(())
}

fn build_registry(config: &ProctordConfig) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    match config.detector.backend.as_str() {
        "stub" => registry.register(StubBackend::new()),
        "tract" => register_tract(&mut registry, config)?,
        other => anyhow::bail!("unknown detector backend '{}'", other),
    }
    Ok(registry)
}

#[cfg(feature = "backend-tract")]
fn register_tract(registry: &mut BackendRegistry, config: &ProctordConfig) -> Result<()> {
    use proctord::detect::TractBackend;

    let mut backend = TractBackend::new().with_threshold(config.detector.confidence_threshold);
    if let Some(path) = &config.detector.object_model {
        backend = backend.with_object_model(path)?;
    }
    if let Some(path) = &config.detector.face_model {
        backend = backend.with_face_model(path)?;
    }
    if let Some(path) = &config.detector.landmark_model {
        backend = backend.with_landmark_model(path)?;
    }
    registry.register(backend);
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_tract(_registry: &mut BackendRegistry, _config: &ProctordConfig) -> Result<()> {
    anyhow::bail!("detector backend 'tract' requires the backend-tract feature")
}
