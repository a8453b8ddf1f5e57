use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use veil_core::recognizer::FaceRecognizer;
use veil_core::{BackendError, DetectorBackend, DetectorMode, OnnxBackend};
use veil_engine::{BackendRegistry, Config};

/// Load the shared ArcFace model, then start loading every configured SCRFD
/// backend in the background. Backends become usable as they finish.
pub async fn start(config: &Config) -> Result<BackendRegistry> {
    let recognizer_path = config.recognizer_model_path();
    let recognizer = tokio::task::spawn_blocking(move || {
        FaceRecognizer::load(&recognizer_path.to_string_lossy())
            .with_context(|| format!("loading recognizer {}", recognizer_path.display()))
    })
    .await??;
    let recognizer = Arc::new(Mutex::new(recognizer));

    let registry = BackendRegistry::new();
    for name in &config.ensemble_backends {
        let Some(path) = config.backend_model_path(name) else {
            tracing::warn!(backend = %name, "no model file configured for backend; skipping");
            continue;
        };
        let recognizer = Arc::clone(&recognizer);
        let backend_name = name.clone();
        registry.register_loading(name, move || {
            let backend = OnnxBackend::load(backend_name, &path.to_string_lossy(), recognizer)?;
            Ok::<_, BackendError>(Arc::new(backend) as Arc<dyn DetectorBackend>)
        })?;
    }
    Ok(registry)
}

/// Registry for triage. With detection off nothing is loaded: every image is
/// allowed without touching a model.
pub async fn start_for_scan(config: &Config) -> Result<BackendRegistry> {
    if config.detector_mode == DetectorMode::Off {
        tracing::info!("detection off; no backends loaded");
        return Ok(BackendRegistry::new());
    }
    start(config).await
}
