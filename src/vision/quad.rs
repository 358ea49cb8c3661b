//! Document boundary detection
//!
//! Finds the dominant four-sided outline in a photograph: blur, Otsu
//! binarization, Canny edges, external contours by area, polygon
//! approximation. The first contour that reduces to exactly four vertices wins.

use image::RgbImage;
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::dilate;
use std::path::Path;
use tracing::debug;

use super::geometry::{approximate_closed_polygon, arc_length, binarize, external_contours, polygon_area};
use super::{load_rgb, save_rgb, visualize, Quadrilateral};
use crate::config::QuadConfig;
use crate::error::ItemError;

/// Locates the outer boundary of a document
pub struct QuadrilateralFinder {
    config: QuadConfig,
}

impl QuadrilateralFinder {
    pub fn new(config: QuadConfig) -> Self {
        Self { config }
    }

    /// Search an image for a four-sided boundary. Corners come back in
    /// contour order, not canonical order.
    pub fn find(&self, image: &RgbImage) -> Option<Quadrilateral> {
        let gray = image::imageops::grayscale(image);
        let blurred = if self.config.blur_sigma > 0.0 {
            gaussian_blur_f32(&gray, self.config.blur_sigma)
        } else {
            gray
        };

        let level = otsu_level(&blurred);
        let binary = binarize(&blurred, level, false);
        let edges = canny(&binary, self.config.canny_low, self.config.canny_high);
        // Close single-pixel gaps so each outline traces as one loop
        let edges = dilate(&edges, Norm::LInf, 1);

        let mut contours: Vec<(f64, Vec<(f64, f64)>)> = external_contours(&edges)
            .into_iter()
            .map(|c| (polygon_area(&c), c))
            .collect();
        contours.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        contours.truncate(self.config.max_contours);

        debug!(level, candidates = contours.len(), "Searching contours for a quadrilateral");

        for (area, contour) in &contours {
            let epsilon = self.config.approx_epsilon_ratio * arc_length(contour, true);
            let approx = approximate_closed_polygon(contour, epsilon);
            if approx.len() == 4 {
                debug!(area, "Found four-sided contour");
                let mut points = [(0.0f32, 0.0f32); 4];
                for (slot, &(x, y)) in points.iter_mut().zip(&approx) {
                    *slot = (x as f32, y as f32);
                }
                return Some(Quadrilateral::new(points));
            }
        }

        None
    }

    pub fn draws_audit(&self) -> bool {
        self.config.draw_audit
    }

    /// Copy of the source image with the accepted boundary drawn over it
    pub fn audit_image(&self, image: &RgbImage, quad: &Quadrilateral) -> RgbImage {
        let mut audit = image.clone();
        visualize::draw_quadrilateral(&mut audit, quad, visualize::GREEN, 10);
        audit
    }

    /// Detect the boundary of an image on disk, optionally writing the
    /// audit image to `audit_path`
    pub fn detect_file(&self, path: &Path, audit_path: Option<&Path>) -> Result<Quadrilateral, ItemError> {
        let image = load_rgb(path)?;
        let quad = self.find(&image).ok_or(ItemError::NoQuadrilateral)?;

        if let Some(audit_path) = audit_path.filter(|_| self.draws_audit()) {
            save_rgb(&self.audit_image(&image, &quad), audit_path)?;
        }

        Ok(quad)
    }
}

impl Default for QuadrilateralFinder {
    fn default() -> Self {
        Self::new(QuadConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    /// Black canvas with a white document rectangle
    fn document_image() -> RgbImage {
        let mut img = RgbImage::from_pixel(200, 160, Rgb([0, 0, 0]));
        for y in 30..=130 {
            for x in 40..=160 {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        img
    }

    fn near(actual: (f32, f32), expected: (f32, f32)) -> bool {
        (actual.0 - expected.0).abs() <= 4.0 && (actual.1 - expected.1).abs() <= 4.0
    }

    #[test]
    fn test_finds_document_rectangle() {
        let finder = QuadrilateralFinder::default();
        let quad = finder.find(&document_image()).expect("rectangle should be found");
        let ordered = quad.ordered();

        assert!(near(ordered.points[0], (40.0, 30.0)), "{:?}", ordered);
        assert!(near(ordered.points[1], (160.0, 30.0)), "{:?}", ordered);
        assert!(near(ordered.points[2], (160.0, 130.0)), "{:?}", ordered);
        assert!(near(ordered.points[3], (40.0, 130.0)), "{:?}", ordered);
    }

    #[test]
    fn test_uniform_image_has_no_boundary() {
        let finder = QuadrilateralFinder::default();
        let blank = RgbImage::from_pixel(120, 90, Rgb([128, 128, 128]));
        assert!(finder.find(&blank).is_none());
    }

    #[test]
    fn test_detect_file_writes_audit_image() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("doc.png");
        let audit = dir.path().join("audit").join("doc.png");
        document_image().save(&source).unwrap();

        let finder = QuadrilateralFinder::default();
        let quad = finder.detect_file(&source, Some(&audit)).unwrap();

        assert_eq!(quad.points.len(), 4);
        assert!(audit.is_file());
    }

    #[test]
    fn test_detect_file_errors() {
        let dir = TempDir::new().unwrap();
        let finder = QuadrilateralFinder::default();

        let missing = finder.detect_file(&dir.path().join("nope.png"), None);
        assert!(matches!(missing, Err(ItemError::ImageUnreadable { .. })));

        let blank = dir.path().join("blank.png");
        RgbImage::from_pixel(64, 64, Rgb([255, 255, 255])).save(&blank).unwrap();
        assert!(matches!(
            finder.detect_file(&blank, None),
            Err(ItemError::NoQuadrilateral)
        ));
    }
}
