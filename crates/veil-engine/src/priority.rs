//! Viewport-relative priority scores for queued images.
//!
//! The score is heuristic. The one ordering it guarantees is that any image
//! with visible pixels outranks any image with none: the in-viewport bonus is
//! larger than the largest possible distance penalty plus every bonus an
//! off-screen image can collect.

use serde::{Deserialize, Serialize};

const IN_VIEWPORT_BONUS: f64 = 10_000.0;
/// Awarded in proportion to the fraction of the viewport the image covers.
const VISIBLE_AREA_BONUS: f64 = 5_000.0;
const ABOVE_FOLD_BONUS: f64 = 1_000.0;
/// Intrinsic pixels per bonus point, and the cap on that bonus.
const INTRINSIC_PIXELS_PER_POINT: f64 = 1_000.0;
const INTRINSIC_BONUS_CAP: f64 = 2_000.0;
/// Points lost per pixel of vertical distance from the viewport centre.
const DISTANCE_PENALTY_PER_PX: f64 = 1.0;
const DISTANCE_PENALTY_CAP: f64 = 5_000.0;

/// Axis-aligned rectangle in document coordinates (pixels).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center_y(&self) -> f64 {
        self.y + self.height / 2.0
    }

    pub fn intersection_area(&self, other: &Rect) -> f64 {
        let w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        w.max(0.0) * h.max(0.0)
    }
}

/// The visible part of the document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub scroll_x: f64,
    pub scroll_y: f64,
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            scroll_x: 0.0,
            scroll_y: 0.0,
            width,
            height,
        }
    }

    pub fn scrolled_to(self, scroll_x: f64, scroll_y: f64) -> Self {
        Self { scroll_x, scroll_y, ..self }
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.scroll_x, self.scroll_y, self.width, self.height)
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1920.0, 1080.0)
    }
}

/// Decoded pixel dimensions of an image, independent of its layout size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntrinsicSize {
    pub width: u32,
    pub height: u32,
}

impl IntrinsicSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> f64 {
        self.width as f64 * self.height as f64
    }
}

/// Higher scores are admitted first.
pub fn priority_score(rect: &Rect, intrinsic: &IntrinsicSize, viewport: &Viewport) -> f64 {
    let view = viewport.rect();
    let visible = rect.intersection_area(&view);
    let mut score = 0.0;

    if visible > 0.0 {
        score += IN_VIEWPORT_BONUS;
        if view.area() > 0.0 {
            score += VISIBLE_AREA_BONUS * (visible / view.area()).min(1.0);
        }
    }

    // The fold is the bottom of the first screen of the document.
    if rect.y < viewport.height {
        score += ABOVE_FOLD_BONUS;
    }

    score += (intrinsic.area() / INTRINSIC_PIXELS_PER_POINT).min(INTRINSIC_BONUS_CAP);

    let distance = (rect.center_y() - view.center_y()).abs();
    score -= (distance * DISTANCE_PENALTY_PER_PX).min(DISTANCE_PENALTY_CAP);

    score
}
