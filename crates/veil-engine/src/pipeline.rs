//! Per-image work: load, preprocess, detect, match.
//!
//! The scheduler only sees the [`DetectAndMatch`] capability. [`Pipeline`] is
//! the production implementation; CPU-heavy stages run on the blocking pool so
//! the runtime stays responsive while inference is in progress.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use image::DynamicImage;
use serde::Serialize;
use thiserror::Error;
use veil_core::{preprocess, DetectorMode, EnsembleDetector, EnsembleError, IdentityMatcher, Verdict};

use crate::engine::Engine;
use crate::registry::{BackendRegistry, RegistryError};

/// Failure classes reported to the verdict sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ImageDecodeFailure,
    BackendUnavailable,
    DetectionFailed,
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("unknown image source: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("image {src}: {source}")]
    Load { src: String, source: LoadError },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
    #[error("pipeline task aborted: {0}")]
    Aborted(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Load { .. } => ErrorKind::ImageDecodeFailure,
            PipelineError::Registry(_) | PipelineError::Ensemble(EnsembleError::NoBackends) => {
                ErrorKind::BackendUnavailable
            }
            PipelineError::Ensemble(EnsembleError::AllBackendsFailed { .. }) | PipelineError::Aborted(_) => {
                ErrorKind::DetectionFailed
            }
        }
    }
}

/// Processing stages, in the order an image passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preprocessing,
    Detecting,
    Matching,
}

/// Told about each stage as an image enters it.
pub trait StageObserver: Send + Sync {
    fn enter(&self, stage: Stage);
}

/// Observer that ignores every stage.
pub struct NoStages;

impl StageObserver for NoStages {
    fn enter(&self, _stage: Stage) {}
}

/// What the scheduler hands to the pipeline for one admitted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageJob {
    pub slot: String,
    pub src: String,
    pub version: u64,
}

/// Image-source collaborator: fetches and decodes an image by its source.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, src: &str) -> Result<DynamicImage, LoadError>;
}

/// Loads sources as local file paths.
pub struct FsImageLoader;

#[async_trait]
impl ImageLoader for FsImageLoader {
    async fn load(&self, src: &str) -> Result<DynamicImage, LoadError> {
        let bytes = tokio::fs::read(src).await.map_err(|source| LoadError::Io {
            path: PathBuf::from(src),
            source,
        })?;
        Ok(image::load_from_memory(&bytes)?)
    }
}

#[async_trait]
pub trait DetectAndMatch: Send + Sync {
    async fn detect_and_match(&self, job: &ImageJob, stages: &dyn StageObserver) -> Result<Verdict, PipelineError>;
}

pub struct Pipeline {
    engine: Engine,
    registry: BackendRegistry,
    loader: Arc<dyn ImageLoader>,
}

impl Pipeline {
    pub fn new(engine: Engine, registry: BackendRegistry, loader: Arc<dyn ImageLoader>) -> Self {
        Self {
            engine,
            registry,
            loader,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

#[async_trait]
impl DetectAndMatch for Pipeline {
    async fn detect_and_match(&self, job: &ImageJob, stages: &dyn StageObserver) -> Result<Verdict, PipelineError> {
        // One snapshot for the whole image: a concurrent config or reference
        // swap never mixes thresholds from two states.
        let state = self.engine.snapshot();
        let policy = state.config.match_policy();

        if policy.mode == DetectorMode::Off {
            tracing::debug!(slot = %job.slot, "detection off; allowing");
            return Ok(Verdict::allow());
        }

        stages.enter(Stage::Preprocessing);
        let decoded = self.loader.load(&job.src).await.map_err(|source| PipelineError::Load {
            src: job.src.clone(),
            source,
        })?;
        let params = state.config.preprocess;
        let variants = tokio::task::spawn_blocking(move || preprocess(&decoded.to_rgb8(), &params))
            .await
            .map_err(|e| PipelineError::Aborted(e.to_string()))?;

        let detections = if variants.is_empty() {
            tracing::debug!(slot = %job.slot, "zero-area image; nothing to detect");
            Vec::new()
        } else {
            stages.enter(Stage::Detecting);
            let backends = self
                .registry
                .acquire(&state.config.ensemble_backends, state.config.backend_ready_timeout())
                .await?;
            let detector = EnsembleDetector::new(backends, state.config.ensemble_params());
            tokio::task::spawn_blocking(move || detector.detect(&variants))
                .await
                .map_err(|e| PipelineError::Aborted(e.to_string()))??
        };

        stages.enter(Stage::Matching);
        let verdict = IdentityMatcher::new(policy).evaluate(&detections, &state.identities);
        tracing::debug!(
            slot = %job.slot,
            faces = verdict.faces_detected,
            matches = verdict.matches.len(),
            blocked = verdict.blocked,
            "image evaluated"
        );
        Ok(verdict)
    }
}
