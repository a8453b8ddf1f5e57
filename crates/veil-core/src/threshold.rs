//! Per-identity adaptive match thresholds.
//!
//! An identity whose reference photos are visually diverse (high spread around
//! the centroid) is harder to match, so its threshold is raised; a visually
//! consistent identity gets a stricter threshold. The adjustment is centred on
//! a normalized variance of 0.5 and always clamped to `[min, max]`.

use serde::{Deserialize, Serialize};

use crate::descriptor;
use crate::types::Embedding;

const DEFAULT_BASE_THRESHOLD: f32 = 0.6;
const DEFAULT_MIN_THRESHOLD: f32 = 0.4;
const DEFAULT_MAX_THRESHOLD: f32 = 0.8;
/// Empirical spread at which normalized variance saturates to 1.0.
const DEFAULT_VARIANCE_SCALE: f32 = 0.8;
const DEFAULT_VARIANCE_WEIGHT: f32 = 1.0;
const DEFAULT_ADJUSTMENT_STEP: f32 = 0.1;
/// Sample count at which the sample-size half of the confidence score saturates.
const DEFAULT_TARGET_SAMPLES: usize = 5;

const CONFIDENCE_SAMPLE_WEIGHT: f32 = 0.6;
const CONFIDENCE_TIGHTNESS_WEIGHT: f32 = 0.4;

/// Tunable inputs of the threshold calculation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdParams {
    pub base: f32,
    pub min: f32,
    pub max: f32,
    pub variance_scale: f32,
    pub variance_weight: f32,
    pub adjustment_step: f32,
    pub target_samples: usize,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_THRESHOLD,
            min: DEFAULT_MIN_THRESHOLD,
            max: DEFAULT_MAX_THRESHOLD,
            variance_scale: DEFAULT_VARIANCE_SCALE,
            variance_weight: DEFAULT_VARIANCE_WEIGHT,
            adjustment_step: DEFAULT_ADJUSTMENT_STEP,
            target_samples: DEFAULT_TARGET_SAMPLES,
        }
    }
}

/// Threshold derived from one identity's enrolled embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveThreshold {
    pub base_threshold: f32,
    /// Distance at or below which a face is blocked.
    pub value: f32,
    /// Mean distance of the embeddings to their centroid.
    pub variance: f32,
    pub sample_count: usize,
    /// Diagnostic score in [0, 1]; never used to gate matching.
    pub confidence: f32,
}

/// Compute the adaptive threshold for a set of embeddings.
///
/// Pure and total: the result depends only on the inputs, so callers recompute
/// it in full whenever the embedding set changes.
pub fn compute_threshold(embeddings: &[Embedding], params: &ThresholdParams) -> AdaptiveThreshold {
    let sample_count = embeddings.len();
    let adequacy = if params.target_samples == 0 {
        1.0
    } else {
        (sample_count as f32 / params.target_samples as f32).min(1.0)
    };

    if sample_count < 2 {
        return AdaptiveThreshold {
            base_threshold: params.base,
            value: params.base,
            variance: 0.0,
            sample_count,
            confidence: CONFIDENCE_SAMPLE_WEIGHT * adequacy,
        };
    }

    let variance = descriptor::variance(embeddings);
    let normalized = normalize_variance(variance, params.variance_scale);
    let adjustment = (normalized - 0.5) * params.variance_weight * params.adjustment_step;
    // An inverted or NaN range has no valid clamp; fall back to the base.
    let value = if params.min <= params.max {
        (params.base + adjustment).clamp(params.min, params.max)
    } else {
        params.base
    };

    let confidence =
        CONFIDENCE_SAMPLE_WEIGHT * adequacy + CONFIDENCE_TIGHTNESS_WEIGHT * (1.0 - normalized);

    AdaptiveThreshold {
        base_threshold: params.base,
        value,
        variance,
        sample_count,
        confidence: confidence.clamp(0.0, 1.0),
    }
}

fn normalize_variance(variance: f32, scale: f32) -> f32 {
    if scale <= 0.0 || !variance.is_finite() {
        return 1.0;
    }
    (variance / scale).clamp(0.0, 1.0)
}
