//! Lighting and contrast variants of an input image.
//!
//! Detectors miss faces in backlit, underexposed or flat images; running them
//! over a fixed set of corrected variants widens the operating envelope. The
//! source buffer is never modified.

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;
const CONTRAST_MIDPOINT: f32 = 128.0;

/// Which correction produced a variant. Variant index order is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Equalized,
    Brightened,
    Darkened,
    Contrasted,
}

pub const VARIANT_ORDER: [VariantKind; 4] = [
    VariantKind::Equalized,
    VariantKind::Brightened,
    VariantKind::Darkened,
    VariantKind::Contrasted,
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessParams {
    /// Multiplicative gain for the brightened variant.
    pub brighten: f32,
    /// Multiplicative gain for the darkened variant.
    pub darken: f32,
    /// Stretch factor around the 128 midpoint for the contrast variant.
    pub contrast: f32,
}

impl Default for PreprocessParams {
    fn default() -> Self {
        Self {
            brighten: 1.3,
            darken: 0.7,
            contrast: 1.5,
        }
    }
}

/// One preprocessed copy of the source image.
#[derive(Debug, Clone)]
pub struct Variant {
    pub kind: VariantKind,
    pub image: RgbImage,
}

/// Produce every variant in [`VARIANT_ORDER`]. A zero-area source yields no
/// variants, meaning no detection is possible.
pub fn preprocess(source: &RgbImage, params: &PreprocessParams) -> Vec<Variant> {
    if source.width() == 0 || source.height() == 0 {
        return Vec::new();
    }

    VARIANT_ORDER
        .iter()
        .map(|&kind| {
            let image = match kind {
                VariantKind::Equalized => equalize_luminance(source),
                VariantKind::Brightened => scale_brightness(source, params.brighten),
                VariantKind::Darkened => scale_brightness(source, params.darken),
                VariantKind::Contrasted => stretch_contrast(source, params.contrast),
            };
            Variant { kind, image }
        })
        .collect()
}

fn luminance(p: &Rgb<u8>) -> f32 {
    LUMA_R * p[0] as f32 + LUMA_G * p[1] as f32 + LUMA_B * p[2] as f32
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Histogram-equalize luminance, then rescale every channel of a pixel by the
/// ratio between its equalized and original luminance.
pub fn equalize_luminance(source: &RgbImage) -> RgbImage {
    let mut hist = [0u32; 256];
    for p in source.pixels() {
        hist[clamp_u8(luminance(p)) as usize] += 1;
    }

    let mut cdf = [0u32; 256];
    let mut running = 0u32;
    for (i, count) in hist.iter().enumerate() {
        running += count;
        cdf[i] = running;
    }

    let total = running as f32;
    let cdf_min = cdf.iter().copied().find(|&v| v > 0).unwrap_or(0) as f32;
    let denom = total - cdf_min;

    let mut out = source.clone();
    if denom <= 0.0 {
        // Single-tone image: nothing to spread.
        return out;
    }

    for p in out.pixels_mut() {
        let lum = luminance(p);
        let bin = clamp_u8(lum) as usize;
        let target = (cdf[bin] as f32 - cdf_min) / denom * 255.0;
        let ratio = if lum > 0.0 { target / lum } else { 0.0 };
        for c in 0..3 {
            p[c] = if lum > 0.0 {
                clamp_u8(p[c] as f32 * ratio)
            } else {
                clamp_u8(target)
            };
        }
    }
    out
}

/// Multiply every channel by `factor`.
pub fn scale_brightness(source: &RgbImage, factor: f32) -> RgbImage {
    let mut out = source.clone();
    for p in out.pixels_mut() {
        for c in 0..3 {
            p[c] = clamp_u8(p[c] as f32 * factor);
        }
    }
    out
}

/// Linear contrast stretch around the 128 midpoint.
pub fn stretch_contrast(source: &RgbImage, factor: f32) -> RgbImage {
    let mut out = source.clone();
    for p in out.pixels_mut() {
        for c in 0..3 {
            p[c] = clamp_u8((p[c] as f32 - CONTRAST_MIDPOINT) * factor + CONTRAST_MIDPOINT);
        }
    }
    out
}
