//! Face-to-identity matching and the per-image block decision.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::{Identity, IdentitySet};
use crate::types::{Detection, Embedding, FaceMatch, Verdict};

/// How much of the pipeline runs for an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorMode {
    /// Never detect, never block.
    Off,
    /// Detect faces and block only those matching an enrolled identity.
    #[default]
    Selective,
    /// Block every image containing at least one face.
    All,
}

impl FromStr for DetectorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "selective" => Ok(Self::Selective),
            "all" => Ok(Self::All),
            other => Err(format!("unknown detector mode '{other}' (expected off|selective|all)")),
        }
    }
}

impl fmt::Display for DetectorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Selective => "selective",
            Self::All => "all",
        })
    }
}

/// Closest enrolled identity for one probe.
#[derive(Debug, Clone, Copy)]
pub struct BestMatch<'a> {
    pub identity: &'a Identity,
    pub distance: f32,
}

/// Strategy for finding the closest enrolled identity to a probe embedding.
pub trait Matcher {
    fn best_match<'a>(&self, probe: &Embedding, identities: &'a IdentitySet) -> Option<BestMatch<'a>>;
}

/// Minimum Euclidean distance over every enrolled embedding of every identity.
///
/// Identities are visited in label order and only a strictly smaller distance
/// replaces the current best, so ties resolve to the lexicographically first
/// label.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn best_match<'a>(&self, probe: &Embedding, identities: &'a IdentitySet) -> Option<BestMatch<'a>> {
        let mut best: Option<BestMatch<'a>> = None;

        for identity in identities.iter() {
            for enrolled in identity.embeddings() {
                let distance = probe.euclidean_distance(enrolled);
                if !distance.is_finite() {
                    continue;
                }
                let is_better = match &best {
                    None => true,
                    Some(prev) => distance < prev.distance,
                };
                if is_better {
                    best = Some(BestMatch { identity, distance });
                }
            }
        }

        best
    }
}

/// Settings that decide how a distance becomes a block decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    pub mode: DetectorMode,
    pub use_adaptive_thresholds: bool,
    /// Used for every identity when adaptive thresholds are disabled.
    pub base_threshold: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            mode: DetectorMode::Selective,
            use_adaptive_thresholds: true,
            base_threshold: 0.6,
        }
    }
}

/// Turns detected faces into a [`Verdict`] against an identity set.
pub struct IdentityMatcher<M: Matcher = EuclideanMatcher> {
    matcher: M,
    policy: MatchPolicy,
}

impl IdentityMatcher<EuclideanMatcher> {
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            matcher: EuclideanMatcher,
            policy,
        }
    }
}

impl<M: Matcher> IdentityMatcher<M> {
    pub fn with_matcher(matcher: M, policy: MatchPolicy) -> Self {
        Self { matcher, policy }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Verdict for the faces detected in one image.
    pub fn evaluate(&self, faces: &[Detection], identities: &IdentitySet) -> Verdict {
        self.evaluate_probes(faces.iter().map(|f| f.embedding.as_ref()), faces.len(), identities)
    }

    /// Verdict for bare face embeddings.
    pub fn evaluate_embeddings(&self, embeddings: &[Embedding], identities: &IdentitySet) -> Verdict {
        self.evaluate_probes(embeddings.iter().map(Some), embeddings.len(), identities)
    }

    fn evaluate_probes<'e>(
        &self,
        probes: impl Iterator<Item = Option<&'e Embedding>>,
        face_count: usize,
        identities: &IdentitySet,
    ) -> Verdict {
        match self.policy.mode {
            DetectorMode::Off => return Verdict::allow(),
            DetectorMode::All => {
                return Verdict {
                    blocked: face_count > 0,
                    faces_detected: face_count,
                    matches: Vec::new(),
                }
            }
            DetectorMode::Selective => {}
        }

        let mut matches = Vec::new();
        for (face_index, probe) in probes.enumerate() {
            let Some(probe) = probe else {
                continue;
            };
            let Some(best) = self.matcher.best_match(probe, identities) else {
                continue;
            };

            let threshold = if self.policy.use_adaptive_thresholds {
                best.identity.threshold().value
            } else {
                self.policy.base_threshold
            };

            matches.push(FaceMatch {
                label: best.identity.label().to_string(),
                distance: best.distance,
                threshold,
                face_index,
            });
        }

        Verdict {
            blocked: matches.iter().any(FaceMatch::is_blocking),
            faces_detected: face_count,
            matches,
        }
    }
}
