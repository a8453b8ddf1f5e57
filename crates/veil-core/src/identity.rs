//! Enrolled identities and the immutable set matching runs against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::threshold::{compute_threshold, AdaptiveThreshold, ThresholdParams};
use crate::types::Embedding;

/// An enrolled person: a label, at least one embedding, and the threshold
/// derived from those embeddings.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    label: String,
    embeddings: Vec<Embedding>,
    threshold: AdaptiveThreshold,
}

impl Identity {
    /// Build an identity, computing its threshold. Returns `None` for an empty
    /// embedding set: such an identity must never take part in matching.
    pub fn new(label: impl Into<String>, embeddings: Vec<Embedding>, params: &ThresholdParams) -> Option<Self> {
        if embeddings.is_empty() {
            return None;
        }
        let threshold = compute_threshold(&embeddings, params);
        Some(Self {
            label: label.into(),
            embeddings,
            threshold,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn threshold(&self) -> &AdaptiveThreshold {
        &self.threshold
    }

    /// A copy of this identity with `more` appended and the threshold recomputed
    /// over the whole set.
    pub fn with_enrolled(&self, more: Vec<Embedding>, params: &ThresholdParams) -> Self {
        let mut embeddings = self.embeddings.clone();
        embeddings.extend(more);
        let threshold = compute_threshold(&embeddings, params);
        Self {
            label: self.label.clone(),
            embeddings,
            threshold,
        }
    }
}

/// Raw reference data for one identity, as handed over by reference storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceIdentity {
    pub label: String,
    pub embeddings: Vec<Embedding>,
}

/// Every enrolled identity, keyed and iterated by label in lexicographic order.
///
/// Never patched in place: any change to reference data or threshold
/// parameters produces a new set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentitySet {
    identities: BTreeMap<String, Identity>,
    params: ThresholdParams,
}

impl IdentitySet {
    /// Build a set from reference data. Identities without embeddings are
    /// skipped; duplicate labels are merged.
    pub fn build(references: impl IntoIterator<Item = ReferenceIdentity>, params: &ThresholdParams) -> Self {
        let mut grouped: BTreeMap<String, Vec<Embedding>> = BTreeMap::new();
        for reference in references {
            grouped
                .entry(reference.label)
                .or_default()
                .extend(reference.embeddings);
        }

        let mut identities = BTreeMap::new();
        for (label, embeddings) in grouped {
            match Identity::new(label.clone(), embeddings, params) {
                Some(identity) => {
                    tracing::debug!(
                        label = %label,
                        samples = identity.threshold.sample_count,
                        threshold = identity.threshold.value,
                        variance = identity.threshold.variance,
                        "identity built"
                    );
                    identities.insert(label, identity);
                }
                None => {
                    tracing::warn!(label = %label, "identity has no embeddings; excluded from matching");
                }
            }
        }

        Self {
            identities,
            params: *params,
        }
    }

    /// A new set with every threshold recomputed under `params`.
    pub fn rethreshold(&self, params: &ThresholdParams) -> Self {
        Self::build(self.to_references(), params)
    }

    /// The reference data this set was built from.
    pub fn to_references(&self) -> Vec<ReferenceIdentity> {
        self.identities
            .values()
            .map(|identity| ReferenceIdentity {
                label: identity.label.clone(),
                embeddings: identity.embeddings.clone(),
            })
            .collect()
    }

    pub fn params(&self) -> &ThresholdParams {
        &self.params
    }

    pub fn get(&self, label: &str) -> Option<&Identity> {
        self.identities.get(label)
    }

    /// Identities in deterministic (lexicographic label) order.
    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}
