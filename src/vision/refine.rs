//! Text box refinement
//!
//! Detector boxes are loose. Each one is shrunk to the ink it contains and
//! then padded back out by a bounded margin so glyph edges survive cropping.

use image::RgbImage;
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::filter::box_filter;
use imageproc::morphology::{dilate, erode};
use tracing::debug;

use super::geometry::{binarize, external_contours};
use super::BoundingBox;
use crate::config::{FallbackPolicy, PaddingConfig};

/// Threshold applied after smoothing the inverted binary crop
const SMOOTHED_INK_LEVEL: u8 = 110;

/// Bounded margin added around a tightened box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaddingPolicy {
    pub horizontal_ratio: f32,
    pub vertical_ratio: f32,
    pub min_horizontal: u32,
    pub max_horizontal: u32,
    pub min_vertical: u32,
    pub max_vertical: u32,
}

impl PaddingPolicy {
    pub fn from_config(config: &PaddingConfig) -> Self {
        Self {
            horizontal_ratio: config.horizontal_ratio,
            vertical_ratio: config.vertical_ratio,
            min_horizontal: config.min_horizontal,
            max_horizontal: config.max_horizontal,
            min_vertical: config.min_vertical,
            max_vertical: config.max_vertical,
        }
    }

    /// Horizontal and vertical padding for a box of the given size
    pub fn padding_for(&self, bbox: &BoundingBox) -> (i32, i32) {
        let horizontal = bounded(
            (self.horizontal_ratio * bbox.width() as f32) as i32,
            self.min_horizontal,
            self.max_horizontal,
        );
        let vertical = bounded(
            (self.vertical_ratio * bbox.height() as f32) as i32,
            self.min_vertical,
            self.max_vertical,
        );
        (horizontal, vertical)
    }

    /// Pad a box and clip it to an image of `width` x `height`
    pub fn apply(&self, bbox: &BoundingBox, width: u32, height: u32) -> BoundingBox {
        let (pad_x, pad_y) = self.padding_for(bbox);
        let max_x = width as i32 - 1;
        let max_y = height as i32 - 1;

        BoundingBox {
            x_min: (bbox.x_min - pad_x).max(0),
            x_max: (bbox.x_max + pad_x).min(max_x),
            y_min: (bbox.y_min - pad_y).max(0),
            y_max: (bbox.y_max + pad_y).min(max_y),
        }
    }
}

impl Default for PaddingPolicy {
    fn default() -> Self {
        Self::from_config(&PaddingConfig::default())
    }
}

fn bounded(value: i32, min: u32, max: u32) -> i32 {
    value.min(max as i32).max(min as i32)
}

/// Result of refining every box of one image
#[derive(Debug, Clone, PartialEq)]
pub struct RefinedBoxes {
    pub boxes: Vec<BoundingBox>,
    /// Some refined box was degenerate and coarse boxes were kept instead
    pub reverted: bool,
}

/// Tightens detector boxes to their text content
#[derive(Debug, Clone)]
pub struct BoundingBoxRefiner {
    policy: PaddingPolicy,
    fallback: FallbackPolicy,
}

impl BoundingBoxRefiner {
    pub fn new(policy: PaddingPolicy, fallback: FallbackPolicy) -> Self {
        Self { policy, fallback }
    }

    pub fn from_config(config: &PaddingConfig) -> Self {
        Self::new(PaddingPolicy::from_config(config), config.fallback)
    }

    /// Tight box around the ink inside `bbox`, in image coordinates.
    /// Returns `None` when the region is empty or holds no ink.
    pub fn shrink_to_content(&self, image: &RgbImage, bbox: &BoundingBox) -> Option<BoundingBox> {
        let x0 = bbox.x_min.max(0);
        let y0 = bbox.y_min.max(0);
        let x1 = bbox.x_max.min(image.width() as i32);
        let y1 = bbox.y_max.min(image.height() as i32);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let crop = image::imageops::crop_imm(image, x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32)
            .to_image();
        let gray = image::imageops::grayscale(&crop);

        // Flat regions have no ink to find
        let (lo, hi) = gray
            .pixels()
            .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
        if lo == hi {
            return None;
        }

        let ink = binarize(&gray, otsu_level(&gray), true);
        let smoothed = box_filter(&ink, 2, 2);
        let mask = binarize(&smoothed, SMOOTHED_INK_LEVEL, false);
        let mask = dilate(&mask, Norm::LInf, 3);
        let mask = erode(&mask, Norm::LInf, 1);

        let contours = external_contours(&mask);
        let mut points = contours.iter().flatten();
        let first = points.next()?;
        let (mut min_x, mut max_x, mut min_y, mut max_y) = (first.0, first.0, first.1, first.1);
        for &(x, y) in points {
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);
        }

        Some(BoundingBox {
            x_min: x0 + min_x as i32,
            x_max: x0 + max_x as i32,
            y_min: y0 + min_y as i32,
            y_max: y0 + max_y as i32,
        })
    }

    /// Shrink then pad a single box. A box with no detectable ink is
    /// returned unchanged.
    pub fn refine(&self, image: &RgbImage, bbox: &BoundingBox) -> BoundingBox {
        match self.shrink_to_content(image, bbox) {
            Some(tight) => self.policy.apply(&tight, image.width(), image.height()),
            None => *bbox,
        }
    }

    /// Refine every box of one image, honouring the fallback policy when a
    /// refined box comes out degenerate
    pub fn refine_set(&self, image: &RgbImage, boxes: &[BoundingBox]) -> RefinedBoxes {
        let refined: Vec<BoundingBox> = boxes.iter().map(|b| self.refine(image, b)).collect();
        let degenerate = refined.iter().filter(|b| b.is_degenerate()).count();

        if degenerate == 0 {
            return RefinedBoxes {
                boxes: refined,
                reverted: false,
            };
        }

        debug!(degenerate, policy = ?self.fallback, "Refinement produced degenerate boxes");
        match self.fallback {
            FallbackPolicy::WholeSet => RefinedBoxes {
                boxes: boxes.to_vec(),
                reverted: true,
            },
            FallbackPolicy::PerBox => RefinedBoxes {
                boxes: refined
                    .into_iter()
                    .zip(boxes)
                    .map(|(r, coarse)| if r.is_degenerate() { *coarse } else { r })
                    .collect(),
                reverted: true,
            },
        }
    }
}

impl Default for BoundingBoxRefiner {
    fn default() -> Self {
        Self::from_config(&PaddingConfig::default())
    }
}
