//! Vector math over fixed-length face descriptors.

use crate::types::Embedding;

/// Euclidean distance between two descriptors.
///
/// Descriptors of different length come from different models and are never
/// comparable; their distance is `f32::INFINITY`.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Element-wise mean of a set of embeddings.
///
/// Returns `None` for an empty set or when dimensions disagree.
pub fn centroid(embeddings: &[Embedding]) -> Option<Vec<f32>> {
    let first = embeddings.first()?;
    let dim = first.dim();
    if embeddings.iter().any(|e| e.dim() != dim) {
        return None;
    }

    let mut sum = vec![0.0f32; dim];
    for e in embeddings {
        for (acc, v) in sum.iter_mut().zip(e.values.iter()) {
            *acc += v;
        }
    }
    let n = embeddings.len() as f32;
    sum.iter_mut().for_each(|v| *v /= n);
    Some(sum)
}

/// Intra-set spread: mean Euclidean distance from each embedding to the centroid.
///
/// Zero for fewer than two embeddings or inconsistent dimensions.
pub fn variance(embeddings: &[Embedding]) -> f32 {
    if embeddings.len() < 2 {
        return 0.0;
    }
    let Some(center) = centroid(embeddings) else {
        return 0.0;
    };
    embeddings
        .iter()
        .map(|e| euclidean_distance(&e.values, &center))
        .sum::<f32>()
        / embeddings.len() as f32
}

/// Weighted element-wise mean. Weights need not sum to one.
pub fn weighted_mean(vectors: &[(&[f32], f32)]) -> Option<Vec<f32>> {
    let (first, _) = vectors.first()?;
    let dim = first.len();
    let total: f32 = vectors.iter().map(|(_, w)| w).sum();
    if total <= 0.0 || vectors.iter().any(|(v, _)| v.len() != dim) {
        return None;
    }

    let mut out = vec![0.0f32; dim];
    for (v, w) in vectors {
        for (acc, x) in out.iter_mut().zip(v.iter()) {
            *acc += x * w;
        }
    }
    out.iter_mut().for_each(|x| *x /= total);
    Some(out)
}

/// Scale a vector to unit L2 norm in place. Zero vectors are left untouched.
pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|x| *x /= norm);
    }
}
