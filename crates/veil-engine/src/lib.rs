//! veil-engine — Runtime half of Veil.
//!
//! Holds the swappable engine state (configuration plus enrolled identities),
//! the registry of detector backends, the per-image detect-and-match pipeline
//! and the viewport-prioritised scheduler that drives it.

pub mod config;
pub mod engine;
pub mod pipeline;
pub mod priority;
pub mod registry;
pub mod scheduler;

pub use config::{Config, ConfigError};
pub use engine::{Engine, EngineState, ReferenceError, ReferenceStore};
pub use pipeline::{DetectAndMatch, ErrorKind, FsImageLoader, ImageJob, ImageLoader, LoadError, Pipeline, PipelineError};
pub use priority::{priority_score, IntrinsicSize, Rect, Viewport};
pub use registry::{BackendRegistry, BackendStatus, RegistryError};
pub use scheduler::{ChannelSink, Enqueued, ImageRef, ScanEvent, SchedulerError, TriageScheduler, VerdictSink, WorkState};
