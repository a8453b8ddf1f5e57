//! Multi-backend, multi-variant face detection.
//!
//! Every backend runs over every preprocessed variant, producing one
//! [`CandidateSet`] per (backend, variant) pair. The candidate sets are then
//! reduced to a single list of detections for the image, either by picking the
//! best-scoring set outright or by clustering boxes that several backends agree
//! on.
//!
//! Candidate sets are always ordered by backend position, then variant index,
//! and every selection breaks ties in favour of the earlier set, so the outcome
//! never depends on thread scheduling or map iteration order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::DetectorBackend;
use crate::descriptor;
use crate::preprocess::Variant;
use crate::types::{BoundingBox, Detection, Embedding};

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("no detector backends configured")]
    NoBackends,
    #[error("every backend failed on every variant ({attempts} attempts)")]
    AllBackendsFailed { attempts: usize },
}

/// Output of one backend over one variant. Exists only while scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSet {
    pub model: String,
    pub variant_index: usize,
    pub detections: Vec<Detection>,
}

impl CandidateSet {
    pub fn face_count(&self) -> usize {
        self.detections.len()
    }

    pub fn mean_confidence(&self) -> f32 {
        if self.detections.is_empty() {
            return 0.0;
        }
        self.detections.iter().map(Detection::confidence).sum::<f32>() / self.detections.len() as f32
    }
}

/// Whether one backend or several contribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleMode {
    Single,
    Ensemble,
}

/// How ensemble candidate sets are reduced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    /// Highest weighted score wins outright.
    #[default]
    BestSet,
    /// IoU clustering with a minimum number of agreeing backends, then NMS.
    Consensus,
}

impl FromStr for FusionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best_set" | "best-set" | "score" => Ok(Self::BestSet),
            "consensus" => Ok(Self::Consensus),
            other => Err(format!("unknown fusion strategy '{other}' (expected best_set|consensus)")),
        }
    }
}

impl fmt::Display for FusionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BestSet => "best_set",
            Self::Consensus => "consensus",
        })
    }
}

/// Set score: `(faces × face_weight + mean_confidence × confidence_weight) × model_weight`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringParams {
    pub face_weight: f32,
    pub confidence_weight: f32,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            face_weight: 1000.0,
            confidence_weight: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleParams {
    pub strategy: FusionStrategy,
    /// Per-backend reliability multiplier; missing backends weigh 1.0.
    pub weights: BTreeMap<String, f32>,
    pub scoring: ScoringParams,
    pub iou_threshold: f32,
    pub min_consensus: usize,
}

impl Default for EnsembleParams {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::BestSet,
            weights: BTreeMap::new(),
            scoring: ScoringParams::default(),
            iou_threshold: 0.5,
            min_consensus: 2,
        }
    }
}

impl EnsembleParams {
    pub fn weight(&self, model: &str) -> f32 {
        self.weights.get(model).copied().unwrap_or(1.0)
    }
}

pub fn score(set: &CandidateSet, weight: f32, scoring: &ScoringParams) -> f32 {
    (set.face_count() as f32 * scoring.face_weight + set.mean_confidence() * scoring.confidence_weight) * weight
}

/// Single-backend selection: the set with the most faces, earliest on ties.
pub fn select_single(sets: &[CandidateSet]) -> Option<&CandidateSet> {
    let mut best: Option<&CandidateSet> = None;
    for set in sets {
        if best.map_or(true, |b| set.face_count() > b.face_count()) {
            best = Some(set);
        }
    }
    best
}

/// Ensemble selection: the non-empty set with the highest weighted score,
/// earliest on ties. `None` when every set is empty.
pub fn select_best<'a>(sets: &'a [CandidateSet], params: &EnsembleParams) -> Option<&'a CandidateSet> {
    let mut best: Option<(&CandidateSet, f32)> = None;
    for set in sets.iter().filter(|s| s.face_count() > 0) {
        let s = score(set, params.weight(&set.model), &params.scoring);
        if best.map_or(true, |(_, top)| s > top) {
            best = Some((set, s));
        }
    }
    best.map(|(set, _)| set)
}

/// Cluster detections across sets by IoU, keep clusters backed by at least
/// `min_consensus` distinct backends, fuse each into one detection, then apply
/// NMS across the fused detections.
pub fn fuse_consensus(sets: &[CandidateSet], iou_threshold: f32, min_consensus: usize) -> Vec<Detection> {
    let mut pool: Vec<(&str, &Detection)> = sets
        .iter()
        .flat_map(|set| set.detections.iter().map(move |d| (set.model.as_str(), d)))
        .collect();
    // Stable sort keeps set order among equal confidences.
    pool.sort_by(|a, b| b.1.confidence().total_cmp(&a.1.confidence()));

    // Each cluster is anchored on its first (most confident) member.
    let mut clusters: Vec<Vec<(&str, &Detection)>> = Vec::new();
    for entry in pool {
        let home = clusters
            .iter_mut()
            .find(|c| c[0].1.bbox.iou(&entry.1.bbox) >= iou_threshold);
        match home {
            Some(cluster) => cluster.push(entry),
            None => clusters.push(vec![entry]),
        }
    }

    let fused: Vec<Detection> = clusters
        .iter()
        .filter(|c| {
            let backends: BTreeSet<&str> = c.iter().map(|(model, _)| *model).collect();
            backends.len() >= min_consensus
        })
        .map(|c| fuse_cluster(c))
        .collect();

    non_max_suppression(fused, iou_threshold, |d| &d.bbox)
}

fn fuse_cluster(members: &[(&str, &Detection)]) -> Detection {
    let total: f32 = members.iter().map(|(_, d)| d.confidence()).sum();
    let w = |d: &Detection| if total > 0.0 { d.confidence() / total } else { 1.0 / members.len() as f32 };

    let mut bbox = BoundingBox {
        x: 0.0,
        y: 0.0,
        width: 0.0,
        height: 0.0,
        confidence: total / members.len() as f32,
        landmarks: members[0].1.bbox.landmarks,
    };
    for (_, d) in members {
        let k = w(*d);
        bbox.x += d.bbox.x * k;
        bbox.y += d.bbox.y * k;
        bbox.width += d.bbox.width * k;
        bbox.height += d.bbox.height * k;
    }

    let weighted: Vec<(&[f32], f32)> = members
        .iter()
        .filter_map(|(_, d)| d.embedding.as_ref().map(|e| (e.values.as_slice(), d.confidence().max(f32::EPSILON))))
        .collect();
    let embedding = descriptor::weighted_mean(&weighted).map(|mut values| {
        descriptor::l2_normalize(&mut values);
        let model_version = members
            .iter()
            .find_map(|(_, d)| d.embedding.as_ref().and_then(|e| e.model_version.clone()));
        Embedding { values, model_version }
    });

    Detection { bbox, embedding }
}

/// Greedy non-maximum suppression by descending confidence.
pub(crate) fn non_max_suppression<T>(
    mut items: Vec<T>,
    iou_threshold: f32,
    bbox: impl Fn(&T) -> &BoundingBox,
) -> Vec<T> {
    items.sort_by(|a, b| bbox(b).confidence.total_cmp(&bbox(a).confidence));

    let mut keep: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        let overlaps = keep.iter().any(|k| bbox(k).iou(bbox(&item)) > iou_threshold);
        if !overlaps {
            keep.push(item);
        }
    }
    keep
}

/// Runs the configured backends over image variants and reduces the results.
pub struct EnsembleDetector {
    backends: Vec<Arc<dyn DetectorBackend>>,
    params: EnsembleParams,
}

impl EnsembleDetector {
    pub fn new(backends: Vec<Arc<dyn DetectorBackend>>, params: EnsembleParams) -> Self {
        Self { backends, params }
    }

    pub fn mode(&self) -> EnsembleMode {
        if self.backends.len() > 1 {
            EnsembleMode::Ensemble
        } else {
            EnsembleMode::Single
        }
    }

    /// Run every backend over every variant in parallel. Individual failures
    /// are logged and skipped; only a total failure is an error.
    pub fn run_candidates(&self, variants: &[Variant]) -> Result<Vec<CandidateSet>, EnsembleError> {
        if self.backends.is_empty() {
            return Err(EnsembleError::NoBackends);
        }

        let jobs: Vec<(&Arc<dyn DetectorBackend>, usize, &Variant)> = self
            .backends
            .iter()
            .flat_map(|b| variants.iter().enumerate().map(move |(i, v)| (b, i, v)))
            .collect();
        let attempts = jobs.len();

        let results: Vec<Option<CandidateSet>> = jobs
            .par_iter()
            .map(|(backend, variant_index, variant)| match backend.detect(&variant.image) {
                Ok(detections) => Some(CandidateSet {
                    model: backend.name().to_string(),
                    variant_index: *variant_index,
                    detections,
                }),
                Err(err) => {
                    tracing::warn!(
                        backend = backend.name(),
                        variant = ?variant.kind,
                        error = %err,
                        "backend failed on variant"
                    );
                    None
                }
            })
            .collect();

        let sets: Vec<CandidateSet> = results.into_iter().flatten().collect();
        if attempts > 0 && sets.is_empty() {
            return Err(EnsembleError::AllBackendsFailed { attempts });
        }
        Ok(sets)
    }

    /// Detections for one image. An empty list means no face was found.
    pub fn detect(&self, variants: &[Variant]) -> Result<Vec<Detection>, EnsembleError> {
        if variants.is_empty() {
            return Ok(Vec::new());
        }
        let sets = self.run_candidates(variants)?;
        Ok(self.reduce(&sets))
    }

    /// Reduce candidate sets according to the mode and fusion strategy.
    pub fn reduce(&self, sets: &[CandidateSet]) -> Vec<Detection> {
        let chosen = match (self.mode(), self.params.strategy) {
            (EnsembleMode::Single, _) => select_single(sets),
            (EnsembleMode::Ensemble, FusionStrategy::BestSet) => select_best(sets, &self.params),
            (EnsembleMode::Ensemble, FusionStrategy::Consensus) => {
                let required = self.params.min_consensus.clamp(1, self.backends.len());
                let fused = fuse_consensus(sets, self.params.iou_threshold, required);
                tracing::debug!(faces = fused.len(), required, "consensus fusion");
                return fused;
            }
        };

        match chosen {
            Some(set) => {
                tracing::debug!(
                    model = %set.model,
                    variant = set.variant_index,
                    faces = set.face_count(),
                    "candidate set selected"
                );
                set.detections.clone()
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::preprocess::{preprocess, PreprocessParams};
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn det(x: f32, conf: f32) -> Detection {
        Detection {
            bbox: BoundingBox {
                x, y: 0.0, width: 100.0, height: 100.0, confidence: conf, landmarks: None,
            },
            embedding: None,
        }
    }

    fn det_with(x: f32, conf: f32, values: &[f32]) -> Detection {
        Detection {
            embedding: Some(Embedding::new(values.to_vec())),
            ..det(x, conf)
        }
    }

    fn set(model: &str, variant_index: usize, detections: Vec<Detection>) -> CandidateSet {
        CandidateSet { model: model.into(), variant_index, detections }
    }

    fn weights(pairs: &[(&str, f32)]) -> EnsembleParams {
        EnsembleParams {
            weights: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ..Default::default()
        }
    }

    /// Returns faces whose count depends on the mean brightness of the variant.
    struct BrightnessBackend {
        name: &'static str,
        calls: AtomicUsize,
    }

    impl DetectorBackend for BrightnessBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mean = image.pixels().map(|p| p[0] as f32).sum::<f32>() / image.pixels().len() as f32;
            let faces = if mean > 150.0 { 2 } else { 1 };
            Ok((0..faces).map(|i| det(i as f32 * 300.0, 0.8)).collect())
        }
    }

    struct FailingBackend;

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &str {
            "broken"
        }

        fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>, BackendError> {
            Err(BackendError::Failed {
                name: "broken".into(),
                reason: "model not loaded".into(),
            })
        }
    }

    fn failing() -> Vec<Arc<dyn DetectorBackend>> {
        vec![Arc::new(FailingBackend)]
    }

    fn variants() -> Vec<Variant> {
        let src = RgbImage::from_pixel(8, 8, Rgb([120, 120, 120]));
        preprocess(&src, &PreprocessParams::default())
    }

    #[test]
    fn test_score_monotonic_in_faces_then_confidence_then_weight() {
        let s = ScoringParams::default();
        let one_sure = set("m", 0, vec![det(0.0, 0.99)]);
        let two_unsure = set("m", 0, vec![det(0.0, 0.1), det(200.0, 0.1)]);
        assert!(score(&two_unsure, 1.0, &s) > score(&one_sure, 1.0, &s));

        let one_unsure = set("m", 0, vec![det(0.0, 0.5)]);
        assert!(score(&one_sure, 1.0, &s) > score(&one_unsure, 1.0, &s));
        assert!(score(&one_unsure, 1.5, &s) > score(&one_unsure, 1.0, &s));
    }

    #[test]
    fn test_select_single_prefers_most_faces_then_first() {
        let sets = vec![
            set("m", 0, vec![det(0.0, 0.9)]),
            set("m", 1, vec![det(0.0, 0.9), det(200.0, 0.9)]),
            set("m", 2, vec![det(0.0, 0.9), det(200.0, 0.9)]),
        ];
        assert_eq!(select_single(&sets).unwrap().variant_index, 1);
        assert!(select_single(&[]).is_none());
    }

    #[test]
    fn test_select_best_uses_model_weight() {
        let sets = vec![
            set("fast", 0, vec![det(0.0, 0.9)]),
            set("thorough", 0, vec![det(0.0, 0.8)]),
        ];
        let params = weights(&[("fast", 1.0), ("thorough", 1.5)]);
        assert_eq!(select_best(&sets, &params).unwrap().model, "thorough");
    }

    #[test]
    fn test_select_best_skips_empty_and_is_deterministic() {
        let sets = vec![
            set("a", 0, vec![]),
            set("a", 1, vec![det(0.0, 0.7)]),
            set("b", 0, vec![det(0.0, 0.7)]),
        ];
        let params = EnsembleParams::default();
        for _ in 0..10 {
            let best = select_best(&sets, &params).unwrap();
            assert_eq!((best.model.as_str(), best.variant_index), ("a", 1));
        }
        assert!(select_best(&[set("a", 0, vec![])], &params).is_none());
    }

    #[test]
    fn test_consensus_requires_agreement() {
        let sets = vec![
            set("a", 0, vec![det(0.0, 0.9), det(500.0, 0.95)]),
            set("b", 0, vec![det(5.0, 0.8)]),
            set("a", 1, vec![det(502.0, 0.9)]),
        ];
        // The face at x≈500 is only seen by backend "a".
        let fused = fuse_consensus(&sets, 0.5, 2);
        assert_eq!(fused.len(), 1);
        let face = &fused[0];
        // Confidence-weighted: (0*0.9 + 5*0.8) / 1.7
        assert!((face.bbox.x - 4.0 / 1.7).abs() < 1e-4, "x = {}", face.bbox.x);
        assert!((face.bbox.confidence - 0.85).abs() < 1e-6);

        assert_eq!(fuse_consensus(&sets, 0.5, 1).len(), 2);
    }

    #[test]
    fn test_consensus_averages_and_renormalizes_embeddings() {
        let sets = vec![
            set("a", 0, vec![det_with(0.0, 0.5, &[1.0, 0.0])]),
            set("b", 0, vec![det_with(0.0, 0.5, &[0.0, 1.0])]),
        ];
        let fused = fuse_consensus(&sets, 0.5, 2);
        let e = fused[0].embedding.as_ref().unwrap();
        let norm = e.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((e.values[0] - e.values[1]).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let kept = non_max_suppression(vec![det(0.0, 0.8), det(5.0, 0.9), det(400.0, 0.7)], 0.4, |d| &d.bbox);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence(), 0.9);
        assert_eq!(kept[1].confidence(), 0.7);
        assert!(non_max_suppression(Vec::<Detection>::new(), 0.4, |d| &d.bbox).is_empty());
    }

    #[test]
    fn test_single_backend_runs_every_variant() {
        let backend = Arc::new(BrightnessBackend { name: "only", calls: AtomicUsize::new(0) });
        let shared: Arc<dyn DetectorBackend> = backend.clone();
        let detector = EnsembleDetector::new(vec![shared], EnsembleParams::default());
        assert_eq!(detector.mode(), EnsembleMode::Single);

        let faces = detector.detect(&variants()).unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
        // Only the brightened variant (120 × 1.3 = 156) reveals the second face.
        assert_eq!(faces.len(), 2);
    }

    #[test]
    fn test_failed_backend_degrades_to_remaining() {
        let good: Arc<dyn DetectorBackend> = Arc::new(BrightnessBackend { name: "good", calls: AtomicUsize::new(0) });
        let broken: Arc<dyn DetectorBackend> = Arc::new(FailingBackend);
        let detector = EnsembleDetector::new(vec![broken, good], EnsembleParams::default());
        assert_eq!(detector.mode(), EnsembleMode::Ensemble);
        let sets = detector.run_candidates(&variants()).unwrap();
        assert_eq!(sets.len(), 4);
        assert!(sets.iter().all(|s| s.model == "good"));
        assert_eq!(detector.detect(&variants()).unwrap().len(), 2);
    }

    #[test]
    fn test_all_backends_failing_is_an_error() {
        let detector = EnsembleDetector::new(failing(), EnsembleParams::default());
        assert!(matches!(
            detector.detect(&variants()),
            Err(EnsembleError::AllBackendsFailed { attempts: 4 })
        ));
    }

    #[test]
    fn test_no_variants_is_empty_not_error() {
        let detector = EnsembleDetector::new(failing(), EnsembleParams::default());
        assert!(detector.detect(&[]).unwrap().is_empty());
        let none = EnsembleDetector::new(vec![], EnsembleParams::default());
        assert!(matches!(none.run_candidates(&variants()), Err(EnsembleError::NoBackends)));
    }

    fn brightness(name: &'static str) -> Arc<dyn DetectorBackend> {
        Arc::new(BrightnessBackend { name, calls: AtomicUsize::new(0) })
    }

    #[test]
    fn test_consensus_quorum_capped_at_backend_count() {
        let params = EnsembleParams {
            strategy: FusionStrategy::Consensus,
            min_consensus: 3,
            ..Default::default()
        };
        let detector = EnsembleDetector::new(vec![brightness("a"), brightness("b")], params);
        assert_eq!(detector.mode(), EnsembleMode::Ensemble);
        let sets = vec![
            set("a", 0, vec![det(0.0, 0.9)]),
            set("b", 0, vec![det(4.0, 0.8)]),
        ];
        // Three agreeing backends cannot exist with two loaded; both agreeing is enough.
        let fused = detector.reduce(&sets);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].bbox.confidence - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_consensus_with_one_backend_selects_single_set() {
        let params = EnsembleParams {
            strategy: FusionStrategy::Consensus,
            min_consensus: 2,
            ..Default::default()
        };
        let detector = EnsembleDetector::new(vec![brightness("only")], params);
        assert_eq!(detector.mode(), EnsembleMode::Single);
        let sets = vec![
            set("only", 0, vec![det(0.0, 0.9)]),
            set("only", 1, vec![det(0.0, 0.6), det(300.0, 0.6)]),
        ];
        let faces = detector.reduce(&sets);
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[1].bbox.x, 300.0);
    }
}
