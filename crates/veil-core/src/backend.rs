//! The detector-backend capability and its ONNX Runtime implementation.

use std::sync::{Arc, Mutex};

use image::RgbImage;
use thiserror::Error;

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Detection;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("backend '{0}' session lock poisoned")]
    Poisoned(String),
    #[error("backend '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
}

/// A face detector, optionally extracting one embedding per face.
///
/// Implementations must treat the image as read-only; the ensemble calls
/// `detect` concurrently from several threads.
pub trait DetectorBackend: Send + Sync {
    /// Backend identifier, used for weights and logging.
    fn name(&self) -> &str;

    /// Detect faces, highest confidence first.
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, BackendError>;
}

/// SCRFD detection paired with ArcFace embedding extraction.
///
/// Several backends may share one recognizer so that every backend produces
/// embeddings in the same space.
pub struct OnnxBackend {
    name: String,
    detector: Mutex<FaceDetector>,
    recognizer: Arc<Mutex<FaceRecognizer>>,
}

impl OnnxBackend {
    pub fn load(
        name: impl Into<String>,
        detector_path: &str,
        recognizer: Arc<Mutex<FaceRecognizer>>,
    ) -> Result<Self, BackendError> {
        let detector = FaceDetector::load(detector_path)?;
        Ok(Self {
            name: name.into(),
            detector: Mutex::new(detector),
            recognizer,
        })
    }
}

impl DetectorBackend for OnnxBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, BackendError> {
        let boxes = {
            let mut detector = self
                .detector
                .lock()
                .map_err(|_| BackendError::Poisoned(self.name.clone()))?;
            detector.detect(image)?
        };
        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut recognizer = self
            .recognizer
            .lock()
            .map_err(|_| BackendError::Poisoned(self.name.clone()))?;

        let detections = boxes
            .into_iter()
            .map(|bbox| {
                let embedding = match recognizer.extract(image, &bbox) {
                    Ok(e) => Some(e),
                    Err(err) => {
                        tracing::warn!(backend = %self.name, error = %err, "embedding extraction failed; face kept without descriptor");
                        None
                    }
                };
                Detection { bbox, embedding }
            })
            .collect();

        Ok(detections)
    }
}
