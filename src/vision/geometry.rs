//! Contour and polygon helpers shared by the boundary finder and the box refiner

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::{threshold, ThresholdType};

/// Contour vertex in image coordinates
pub type Vertex = (f64, f64);

/// Threshold a grayscale image at `level`.
///
/// Pixels strictly above the level become 255 (0 when `inverted`).
pub fn binarize(gray: &GrayImage, level: u8, inverted: bool) -> GrayImage {
    let kind = if inverted {
        ThresholdType::BinaryInverted
    } else {
        ThresholdType::Binary
    };
    threshold(gray, level, kind)
}

/// Outermost contours of a binary image. Hole borders and anything nested
/// inside another border are dropped.
pub fn external_contours(binary: &GrayImage) -> Vec<Vec<Vertex>> {
    find_contours::<i32>(binary)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|c| {
            c.points
                .into_iter()
                .map(|p| (p.x as f64, p.y as f64))
                .collect()
        })
        .collect()
}

/// Enclosed area of a polygon (shoelace formula, vertices in either winding)
pub fn polygon_area(points: &[Vertex]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let n = points.len();
    let mut area = 0.0;
    for i in 0..n {
        let j = (i + 1) % n;
        area += points[i].0 * points[j].1;
        area -= points[j].0 * points[i].1;
    }
    area.abs() / 2.0
}

/// Length of a polyline, including the closing edge when `closed`
pub fn arc_length(points: &[Vertex], closed: bool) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let mut length: f64 = points.windows(2).map(|w| distance(w[0], w[1])).sum();
    if closed {
        length += distance(points[points.len() - 1], points[0]);
    }
    length
}

/// Whether the polygon is strictly convex: every turn has the same
/// orientation and no edge is collinear with the next
pub fn is_convex(points: &[Vertex]) -> bool {
    let n = points.len();
    if n < 3 {
        return false;
    }

    let mut sign = 0.0;
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        let c = points[(i + 2) % n];
        let cross = (b.0 - a.0) * (c.1 - b.1) - (b.1 - a.1) * (c.0 - b.0);
        if cross.abs() < f64::EPSILON {
            return false;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

/// Simplify a closed contour with the Douglas-Peucker algorithm.
///
/// The curve is split at two mutually distant vertices, each half is
/// simplified as an open polyline, and a last sweep drops vertices lying
/// within `epsilon / sqrt(2)` of the line through their neighbours.
pub fn approximate_closed_polygon(contour: &[Vertex], epsilon: f64) -> Vec<Vertex> {
    let n = contour.len();
    if n <= 2 {
        return contour.to_vec();
    }

    // Converge on two far-apart anchors
    let mut anchor = 0;
    let mut opposite = 0;
    let mut spread = 0.0;
    for _ in 0..3 {
        let (idx, dist) = farthest_from(contour, anchor);
        opposite = anchor;
        anchor = idx;
        spread = dist;
    }
    if spread <= epsilon {
        return vec![contour[opposite]];
    }

    let (first, second) = if opposite < anchor {
        (opposite, anchor)
    } else {
        (anchor, opposite)
    };

    let upper: Vec<Vertex> = contour[first..=second].to_vec();
    let lower: Vec<Vertex> = contour[second..]
        .iter()
        .chain(contour[..=first].iter())
        .copied()
        .collect();

    let mut polygon = simplify_open(&upper, epsilon);
    let lower = simplify_open(&lower, epsilon);
    // Endpoints of the lower half are already present
    if lower.len() > 2 {
        polygon.extend_from_slice(&lower[1..lower.len() - 1]);
    }

    drop_collinear(&mut polygon, epsilon);
    polygon
}

/// Iterative Douglas-Peucker on an open polyline; both endpoints are kept
fn simplify_open(points: &[Vertex], epsilon: f64) -> Vec<Vertex> {
    if points.len() <= 2 {
        return points.to_vec();
    }

    let last = points.len() - 1;
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[last] = true;

    let mut stack = vec![(0usize, last)];
    while let Some((start, end)) = stack.pop() {
        if end - start <= 1 {
            continue;
        }

        let mut max_dist = 0.0;
        let mut max_index = start;
        for i in (start + 1)..end {
            let dist = point_to_line_distance(points[i], points[start], points[end]);
            if dist > max_dist {
                max_dist = dist;
                max_index = i;
            }
        }

        if max_dist > epsilon {
            keep[max_index] = true;
            stack.push((start, max_index));
            stack.push((max_index, end));
        }
    }

    points
        .iter()
        .zip(keep)
        .filter_map(|(&p, k)| k.then_some(p))
        .collect()
}

fn drop_collinear(polygon: &mut Vec<Vertex>, epsilon: f64) {
    let tolerance = epsilon * std::f64::consts::FRAC_1_SQRT_2;
    let mut i = 0;
    while polygon.len() > 3 && i < polygon.len() {
        let n = polygon.len();
        let prev = polygon[(i + n - 1) % n];
        let next = polygon[(i + 1) % n];
        if prev != next && point_to_line_distance(polygon[i], prev, next) <= tolerance {
            polygon.remove(i);
            // Re-check the previous vertex against its new neighbour
            i = i.saturating_sub(1);
        } else {
            i += 1;
        }
    }
}

fn farthest_from(points: &[Vertex], from: usize) -> (usize, f64) {
    let origin = points[from];
    let mut best = (from, 0.0);
    for (i, &p) in points.iter().enumerate() {
        let dist = distance(origin, p);
        if dist > best.1 {
            best = (i, dist);
        }
    }
    best
}

fn distance(a: Vertex, b: Vertex) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Perpendicular distance from a point to the line through `start` and `end`.
/// Falls back to the point distance when the line is degenerate.
fn point_to_line_distance(point: Vertex, start: Vertex, end: Vertex) -> f64 {
    let a = end.1 - start.1;
    let b = start.0 - end.0;
    let c = end.0 * start.1 - start.0 * end.1;

    let denominator = (a * a + b * b).sqrt();
    if denominator == 0.0 {
        return distance(point, start);
    }

    (a * point.0 + b * point.1 + c).abs() / denominator
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Every integer point on the border of an axis-aligned rectangle, clockwise
    fn rectangle_contour(x0: i32, y0: i32, x1: i32, y1: i32) -> Vec<Vertex> {
        let mut points = Vec::new();
        for x in x0..x1 {
            points.push((x as f64, y0 as f64));
        }
        for y in y0..y1 {
            points.push((x1 as f64, y as f64));
        }
        for x in (x0 + 1..=x1).rev() {
            points.push((x as f64, y1 as f64));
        }
        for y in (y0 + 1..=y1).rev() {
            points.push((x0 as f64, y as f64));
        }
        points
    }

    #[test]
    fn test_polygon_area_and_length() {
        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!((polygon_area(&square) - 100.0).abs() < 1e-9);
        assert!((arc_length(&square, true) - 40.0).abs() < 1e-9);
        assert!((arc_length(&square, false) - 30.0).abs() < 1e-9);
        assert_eq!(polygon_area(&square[..2]), 0.0);
    }

    #[test]
    fn test_convexity() {
        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!(is_convex(&square));

        let bowtie = [(0.0, 0.0), (10.0, 10.0), (10.0, 0.0), (0.0, 10.0)];
        assert!(!is_convex(&bowtie));

        let flat = [(0.0, 0.0), (5.0, 0.0), (10.0, 0.0), (0.0, 0.0)];
        assert!(!is_convex(&flat));
    }

    #[test]
    fn test_approximate_rectangle_contour() {
        let contour = rectangle_contour(10, 10, 60, 40);
        let epsilon = 0.1 * arc_length(&contour, true);

        let mut approx = approximate_closed_polygon(&contour, epsilon);
        approx.sort_by(|a, b| a.partial_cmp(b).unwrap());

        assert_eq!(
            approx,
            vec![(10.0, 10.0), (10.0, 40.0), (60.0, 10.0), (60.0, 40.0)]
        );
    }

    #[test]
    fn test_approximate_drops_small_bumps() {
        let mut contour = rectangle_contour(0, 0, 80, 50);
        // A two pixel dent halfway along the top edge
        contour[40] = (40.0, 2.0);
        let epsilon = 0.1 * arc_length(&contour, true);

        assert_eq!(approximate_closed_polygon(&contour, epsilon).len(), 4);
    }

    #[test]
    fn test_approximate_tiny_contour_collapses() {
        let contour = vec![(5.0, 5.0), (6.0, 5.0), (6.0, 6.0), (5.0, 6.0)];
        assert_eq!(approximate_closed_polygon(&contour, 10.0).len(), 1);
    }

    #[test]
    fn test_external_contours_skip_holes() {
        let mut ring = GrayImage::new(50, 50);
        for y in 10..40 {
            for x in 10..40 {
                let border = x < 14 || x >= 36 || y < 14 || y >= 36;
                if border {
                    ring.put_pixel(x, y, Luma([255]));
                }
            }
        }

        let contours = external_contours(&ring);
        assert_eq!(contours.len(), 1);
        let xs: Vec<f64> = contours[0].iter().map(|p| p.0).collect();
        assert_eq!(xs.iter().cloned().fold(f64::INFINITY, f64::min), 10.0);
        assert_eq!(xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max), 39.0);
    }

    #[test]
    fn test_binarize_directions() {
        let mut gray = GrayImage::new(3, 1);
        gray.put_pixel(0, 0, Luma([10]));
        gray.put_pixel(1, 0, Luma([200]));
        gray.put_pixel(2, 0, Luma([100]));

        let normal = binarize(&gray, 100, false);
        assert_eq!(normal.get_pixel(0, 0).0[0], 0);
        assert_eq!(normal.get_pixel(1, 0).0[0], 255);
        // The level itself is not above the level
        assert_eq!(normal.get_pixel(2, 0).0[0], 0);

        let inverted = binarize(&gray, 100, true);
        assert_eq!(inverted.get_pixel(0, 0).0[0], 255);
        assert_eq!(inverted.get_pixel(1, 0).0[0], 0);
        assert_eq!(inverted.get_pixel(2, 0).0[0], 255);
    }
}
