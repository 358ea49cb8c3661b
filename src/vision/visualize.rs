//! Debug renderings written next to stage outputs

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::sync::OnceLock;
use tracing::debug;

use super::{BoundingBox, Point, Quadrilateral};

pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const BLUE: Rgb<u8> = Rgb([0, 0, 255]);
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

const LABEL_SCALE: f32 = 28.0;

const FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// First system font that loads, read once per process. Without one, text
/// labels are skipped.
pub fn label_font() -> Option<&'static FontVec> {
    static FONT: OnceLock<Option<FontVec>> = OnceLock::new();
    FONT.get_or_init(|| {
        for path in FONT_PATHS {
            if let Ok(data) = std::fs::read(path) {
                if let Ok(font) = FontVec::try_from_vec(data) {
                    debug!("Loaded label font: {}", path);
                    return Some(font);
                }
            }
        }
        debug!("No system font found, corner labels will be skipped");
        None
    })
    .as_ref()
}

/// Thick line made of parallel one-pixel segments
pub fn draw_thick_line(image: &mut RgbImage, start: Point, end: Point, color: Rgb<u8>, thickness: u32) {
    let half = (thickness / 2) as i32;
    for offset in -half..=half {
        let o = offset as f32;
        draw_line_segment_mut(image, (start.0 + o, start.1), (end.0 + o, end.1), color);
        draw_line_segment_mut(image, (start.0, start.1 + o), (end.0, end.1 + o), color);
    }
}

/// Closed outline through the four corners in their stored order
pub fn draw_quadrilateral(image: &mut RgbImage, quad: &Quadrilateral, color: Rgb<u8>, thickness: u32) {
    for i in 0..4 {
        let start = quad.points[i];
        let end = quad.points[(i + 1) % 4];
        draw_thick_line(image, start, end, color, thickness);
    }
}

/// Corner markers joined in stored order, used to eyeball the saved
/// coordinates. Each corner is numbered 1-4 when a font is available.
pub fn draw_corner_markers(image: &mut RgbImage, quad: &Quadrilateral, font: Option<&FontVec>) {
    draw_quadrilateral(image, quad, BLUE, 3);
    for &(x, y) in &quad.points {
        draw_filled_circle_mut(image, (x.round() as i32, y.round() as i32), 10, RED);
    }

    let Some(font) = font else { return };
    for (index, &(x, y)) in quad.points.iter().enumerate() {
        let label = (index + 1).to_string();
        draw_text_mut(
            image,
            WHITE,
            x as i32 + 15,
            y as i32 + 15,
            PxScale::from(LABEL_SCALE),
            font,
            &label,
        );
    }
}

/// Hollow rectangles for text boxes. Degenerate boxes are skipped.
pub fn draw_boxes(image: &mut RgbImage, boxes: &[BoundingBox], color: Rgb<u8>, thickness: u32) {
    for bbox in boxes.iter().filter(|b| !b.is_degenerate()) {
        for inset in 0..thickness as i32 {
            let width = bbox.width() - 2 * inset;
            let height = bbox.height() - 2 * inset;
            if width <= 0 || height <= 0 {
                break;
            }
            let rect = Rect::at(bbox.x_min + inset, bbox.y_min + inset).of_size(width as u32, height as u32);
            draw_hollow_rect_mut(image, rect, color);
        }
    }
}

/// Outline polygon of a recognized text span
pub fn draw_polygon(image: &mut RgbImage, points: &[Point], color: Rgb<u8>, thickness: u32) {
    if points.len() < 2 {
        return;
    }
    for i in 0..points.len() {
        let end = points[(i + 1) % points.len()];
        draw_thick_line(image, points[i], end, color, thickness);
    }
}
