//! Vision Layer
//!
//! Document boundary detection, perspective rectification and text box
//! refinement. Everything here is pure image processing; stage bookkeeping
//! lives in the pipeline.

pub mod geometry;
pub mod perspective;
pub mod quad;
pub mod refine;
pub mod visualize;

pub use perspective::PerspectiveRectifier;
pub use quad::QuadrilateralFinder;
pub use refine::BoundingBoxRefiner;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ItemError;
use crate::storage::ensure_parent;

/// A 2D image coordinate
pub type Point = (f32, f32);

/// Axis-aligned text box in pixel coordinates.
///
/// Serialized as `[x_min, x_max, y_min, y_max]`, the layout the detection
/// service returns in its `horizontal_list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x_min: i32,
    pub x_max: i32,
    pub y_min: i32,
    pub y_max: i32,
}

impl BoundingBox {
    pub fn new(x_min: i32, x_max: i32, y_min: i32, y_max: i32) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    pub fn width(&self) -> i32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> i32 {
        self.y_max - self.y_min
    }

    /// A box with no area cannot be cropped or recognized
    pub fn is_degenerate(&self) -> bool {
        self.x_min >= self.x_max || self.y_min >= self.y_max
    }

    /// `[x_min, y_min, x_max, y_max]`, the order the recognition service expects
    pub fn to_corner_array(&self) -> [i32; 4] {
        [self.x_min, self.y_min, self.x_max, self.y_max]
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from(v: [i32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x_min, b.x_max, b.y_min, b.y_max]
    }
}

/// Four corners of a document boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quadrilateral {
    pub points: [Point; 4],
}

impl Quadrilateral {
    pub fn new(points: [Point; 4]) -> Self {
        Self { points }
    }

    /// Build from stored `[x, y]` pairs; anything but exactly four is rejected
    pub fn from_pairs(pairs: &[[f64; 2]]) -> Option<Self> {
        if pairs.len() != 4 {
            return None;
        }
        let mut points = [(0.0, 0.0); 4];
        for (slot, pair) in points.iter_mut().zip(pairs) {
            *slot = (pair[0] as f32, pair[1] as f32);
        }
        Some(Self { points })
    }

    pub fn to_pairs(&self) -> Vec<[f64; 2]> {
        self.points
            .iter()
            .map(|&(x, y)| [x as f64, y as f64])
            .collect()
    }

    /// Canonical corner order: top-left, top-right, bottom-right, bottom-left.
    ///
    /// Top-left has the smallest `x + y` and bottom-right the largest.
    /// Top-right has the smallest `y - x` and bottom-left the largest.
    /// Ties go to the earliest point.
    pub fn ordered(&self) -> Self {
        let sums = self.points.map(|(x, y)| x + y);
        let diffs = self.points.map(|(x, y)| y - x);

        let tl = arg_extreme(&sums, |a, b| a < b);
        let br = arg_extreme(&sums, |a, b| a > b);
        let tr = arg_extreme(&diffs, |a, b| a < b);
        let bl = arg_extreme(&diffs, |a, b| a > b);

        Self {
            points: [
                self.points[tl],
                self.points[tr],
                self.points[br],
                self.points[bl],
            ],
        }
    }
}

/// Index of the first value that wins `better` against every other
fn arg_extreme(values: &[f32; 4], better: impl Fn(f32, f32) -> bool) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if better(v, values[best]) {
            best = i;
        }
    }
    best
}

/// Load any supported image as 8-bit RGB
pub fn load_rgb(path: &Path) -> Result<RgbImage, ItemError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| ItemError::ImageUnreadable {
            path: path.to_path_buf(),
            source,
        })
}

/// Save an RGB image, format chosen by the file extension
pub fn save_rgb(image: &RgbImage, path: &Path) -> Result<(), ItemError> {
    ensure_parent(path).map_err(|source| ItemError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    image.save(path)?;
    Ok(())
}
