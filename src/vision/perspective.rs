//! Perspective rectification
//!
//! Maps a document quadrilateral onto an upright rectangle whose size comes
//! from the quadrilateral's own edge lengths.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use tracing::debug;

use super::geometry::{is_convex, polygon_area};
use super::{Point, Quadrilateral};
use crate::error::ItemError;

/// Areas below this are treated as a collapsed quadrilateral
const MIN_AREA: f64 = 1.0;

/// Warps a quadrilateral region into a rectangle
#[derive(Debug, Clone, Copy, Default)]
pub struct PerspectiveRectifier;

impl PerspectiveRectifier {
    pub fn new() -> Self {
        Self
    }

    /// Output `(width, height)` for a quadrilateral in any corner order.
    ///
    /// Width is the longer of the top and bottom edges, height the longer of
    /// the left and right edges, each truncated to whole pixels.
    pub fn output_size(quad: &Quadrilateral) -> (u32, u32) {
        let [tl, tr, br, bl] = quad.ordered().points;

        let width_bottom = edge_length(br, bl);
        let width_top = edge_length(tr, tl);
        let height_right = edge_length(tr, br);
        let height_left = edge_length(tl, bl);

        let width = width_bottom.trunc().max(width_top.trunc());
        let height = height_right.trunc().max(height_left.trunc());
        (width as u32, height as u32)
    }

    /// Rectify the region enclosed by `quad`
    pub fn rectify(&self, image: &RgbImage, quad: &Quadrilateral) -> Result<RgbImage, ItemError> {
        let ordered = quad.ordered();
        let vertices: Vec<(f64, f64)> = ordered
            .points
            .iter()
            .map(|&(x, y)| (x as f64, y as f64))
            .collect();

        if polygon_area(&vertices) < MIN_AREA {
            return Err(ItemError::DegenerateQuadrilateral("zero area".to_string()));
        }
        if !is_convex(&vertices) {
            return Err(ItemError::DegenerateQuadrilateral(
                "corners do not form a convex outline".to_string(),
            ));
        }

        let (width, height) = Self::output_size(quad);
        if width < 2 || height < 2 {
            return Err(ItemError::DegenerateQuadrilateral(format!(
                "output size {}x{} too small",
                width, height
            )));
        }

        let (w, h) = ((width - 1) as f32, (height - 1) as f32);
        let destination: [Point; 4] = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];

        let projection = Projection::from_control_points(ordered.points, destination).ok_or_else(|| {
            ItemError::DegenerateQuadrilateral("no projective transform fits the corners".to_string())
        })?;

        let mut output = RgbImage::new(width, height);
        warp_into(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut output);

        debug!(width, height, "Rectified document");
        Ok(output)
    }
}

fn edge_length(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}
