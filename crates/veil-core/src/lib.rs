//! veil-core — Face detection and identity matching for image suppression.
//!
//! Preprocesses images into lighting variants, runs one or more detector
//! backends over them, and matches detected face embeddings against enrolled
//! identities using per-identity adaptive thresholds.

pub mod backend;
pub mod descriptor;
pub mod detector;
pub mod ensemble;
pub mod identity;
pub mod matcher;
pub mod preprocess;
pub mod recognizer;
pub mod threshold;
pub mod types;

pub use backend::{BackendError, DetectorBackend, OnnxBackend};
pub use ensemble::{CandidateSet, EnsembleDetector, EnsembleError, EnsembleParams, FusionStrategy};
pub use identity::{Identity, IdentitySet, ReferenceIdentity};
pub use matcher::{DetectorMode, IdentityMatcher, MatchPolicy};
pub use preprocess::{preprocess, PreprocessParams, Variant};
pub use threshold::{compute_threshold, AdaptiveThreshold, ThresholdParams};
pub use types::{BoundingBox, Detection, Embedding, FaceMatch, Verdict};
