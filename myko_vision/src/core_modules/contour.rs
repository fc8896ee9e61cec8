// THEORY:
// A `Contour` is the boundary of one detected instance, stored as an ordered,
// implicitly closed polyline of integer pixel coordinates. It is tied to the
// frame size it was computed on. A `NormalizedContour` is the same polyline
// expressed as fractions of the frame width/height, which is the durable,
// resolution-independent form kept by the mask cache.
//
// Like `SmartBlob` in the spatial layer, these are "dumb" containers that know
// how to summarize themselves (area, perimeter, centroid, bounding box) but
// nothing about frames or queries.

use image::GenericImageView;
use imageproc::geometry::{approximate_polygon_dp, arc_length, convex_hull};
use imageproc::point::Point;
use serde::{Deserialize, Serialize};

pub type PixelPoint = Point<i32>;

/// Height and width of a raster, the validity key for everything pixel-space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameDims {
    pub width: u32,
    pub height: u32,
}

impl FrameDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of<I: GenericImageView>(image: &I) -> Self {
        let (width, height) = image.dimensions();
        Self { width, height }
    }

    pub fn area(&self) -> f64 {
        self.width as f64 * self.height as f64
    }

    pub fn min_side(&self) -> u32 {
        self.width.min(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Axis-aligned box, inclusive of both edge pixels (a single pixel is 1x1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn aspect_ratio(&self) -> f64 {
        let long = self.width.max(self.height).max(1) as f64;
        let short = self.width.min(self.height).max(1) as f64;
        long / short
    }
}

/// Geometric summary of one contour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContourFeatures {
    pub area: f64,
    pub perimeter: f64,
    /// 4π·area / perimeter²; 1.0 for a perfect disk, ≈0.785 for a square.
    pub circularity: f64,
    /// area / convex-hull area.
    pub solidity: f64,
    pub center: (i32, i32),
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Contour {
    pub points: Vec<PixelPoint>,
}

impl Contour {
    pub fn new(points: Vec<PixelPoint>) -> Self {
        Self { points }
    }

    pub fn from_xy(points: &[(i32, i32)]) -> Self {
        Self::new(points.iter().map(|&(x, y)| Point::new(x, y)).collect())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Enclosed polygon area (shoelace), always non-negative.
    pub fn area(&self) -> f64 {
        signed_area(&self.points).abs()
    }

    pub fn perimeter(&self) -> f64 {
        if self.points.len() < 2 {
            return 0.0;
        }
        arc_length(&self.points, true)
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let first = self.points.first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &self.points {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Some(BoundingBox {
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        })
    }

    /// Polygon centroid from the first-order moments. `None` for degenerate
    /// (zero-area or non-finite) polygons.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        let n = self.points.len();
        if n < 3 {
            return None;
        }
        let (mut m00, mut m10, mut m01) = (0.0f64, 0.0f64, 0.0f64);
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            let (ax, ay, bx, by) = (a.x as f64, a.y as f64, b.x as f64, b.y as f64);
            let cross = ax * by - bx * ay;
            m00 += cross;
            m10 += (ax + bx) * cross;
            m01 += (ay + by) * cross;
        }
        m00 *= 0.5;
        if m00.abs() < 1e-9 {
            return None;
        }
        let cx = m10 / (6.0 * m00);
        let cy = m01 / (6.0 * m00);
        (cx.is_finite() && cy.is_finite()).then_some((cx, cy))
    }

    pub fn convex_hull_area(&self) -> f64 {
        if self.points.len() < 3 {
            return 0.0;
        }
        let hull = convex_hull(self.points.as_slice());
        signed_area(&hull).abs()
    }

    /// All features at once; `None` when the contour is degenerate.
    pub fn features(&self) -> Option<ContourFeatures> {
        let area = self.area();
        let perimeter = self.perimeter();
        if area <= 0.0 || perimeter <= 0.0 {
            return None;
        }
        let (cx, cy) = self.centroid()?;
        let bbox = self.bounding_box()?;
        let hull_area = self.convex_hull_area().max(1.0);
        Some(ContourFeatures {
            area,
            perimeter,
            circularity: 4.0 * std::f64::consts::PI * area / (perimeter * perimeter),
            solidity: area / hull_area,
            center: (cx as i32, cy as i32),
            bbox,
        })
    }

    /// Douglas-Peucker simplification of the closed boundary with a tolerance
    /// of `fraction` of the perimeter.
    ///
    /// The closed curve is split at the point farthest from the start so each
    /// half is an open curve with distinct endpoints.
    pub fn simplified(&self, fraction: f64) -> Contour {
        let n = self.points.len();
        if n < 4 {
            return self.clone();
        }
        let epsilon = (fraction * self.perimeter()).max(0.5);
        let start = self.points[0];
        let split = (1..n)
            .max_by_key(|&i| {
                let dx = (self.points[i].x - start.x) as i64;
                let dy = (self.points[i].y - start.y) as i64;
                dx * dx + dy * dy
            })
            .unwrap_or(n / 2);
        if self.points[split] == start {
            return self.clone();
        }

        let first_half = &self.points[..=split];
        let mut second_half: Vec<PixelPoint> = self.points[split..].to_vec();
        second_half.push(start);

        let mut out = approximate_polygon_dp(first_half, epsilon, false);
        let tail = approximate_polygon_dp(&second_half, epsilon, false);
        // Both halves share the split point, and the tail ends on the start point.
        if tail.len() > 2 {
            out.extend_from_slice(&tail[1..tail.len() - 1]);
        }
        Contour::new(out)
    }

    /// Vertices suitable for polygon filling: consecutive duplicates and the
    /// closing duplicate removed.
    pub fn polygon_points(&self) -> Vec<PixelPoint> {
        let mut out: Vec<PixelPoint> = Vec::with_capacity(self.points.len());
        for p in &self.points {
            if out.last() != Some(p) {
                out.push(*p);
            }
        }
        while out.len() > 1 && out.first() == out.last() {
            out.pop();
        }
        out
    }

    /// Resolution-independent form: x / width, y / height.
    pub fn normalize(&self, dims: FrameDims) -> NormalizedContour {
        let w = dims.width.max(1) as f64;
        let h = dims.height.max(1) as f64;
        NormalizedContour {
            points: self
                .points
                .iter()
                .map(|p| (p.x as f64 / w, p.y as f64 / h))
                .collect(),
        }
    }

    /// Direct rescale between two pixel grids by the ratio of their sizes.
    pub fn rescaled(&self, from: FrameDims, to: FrameDims) -> Contour {
        let sx = to.width as f64 / from.width.max(1) as f64;
        let sy = to.height as f64 / from.height.max(1) as f64;
        Contour::new(
            self.points
                .iter()
                .map(|p| {
                    Point::new(
                        project_axis(p.x as f64 * sx, to.width),
                        project_axis(p.y as f64 * sy, to.height),
                    )
                })
                .collect(),
        )
    }
}

/// A contour in [0, 1] fractions of frame width and height.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedContour {
    pub points: Vec<(f64, f64)>,
}

impl NormalizedContour {
    /// Re-projects onto a `dims` grid: `round(clip(x·W, 0, W-1))`, likewise for y.
    pub fn project(&self, dims: FrameDims) -> Contour {
        let w = dims.width as f64;
        let h = dims.height as f64;
        Contour::new(
            self.points
                .iter()
                .map(|&(x, y)| Point::new(project_axis(x * w, dims.width), project_axis(y * h, dims.height)))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn project_axis(value: f64, extent: u32) -> i32 {
    let max = extent.saturating_sub(1) as f64;
    let v = if value.is_finite() { value } else { 0.0 };
    v.clamp(0.0, max).round() as i32
}

fn signed_area(points: &[PixelPoint]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let mut acc = 0i64;
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        acc += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    acc as f64 * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: i32, y0: i32, side: i32) -> Contour {
        let x1 = x0 + side - 1;
        let y1 = y0 + side - 1;
        Contour::from_xy(&[(x0, y0), (x1, y0), (x1, y1), (x0, y1)])
    }

    #[test]
    fn square_features() {
        let f = square(50, 50, 100).features().unwrap();
        assert!((f.area - 99.0 * 99.0).abs() < 1e-9);
        assert!((f.perimeter - 396.0).abs() < 1e-9);
        assert!((f.circularity - std::f64::consts::FRAC_PI_4).abs() < 1e-3);
        assert!((f.solidity - 1.0).abs() < 1e-9);
        assert_eq!(
            f.bbox,
            BoundingBox {
                x: 50,
                y: 50,
                width: 100,
                height: 100
            }
        );
        assert_eq!(f.center, (99, 99));
    }

    #[test]
    fn degenerate_contours_have_no_features() {
        assert!(Contour::default().features().is_none());
        assert!(Contour::from_xy(&[(0, 0), (5, 5)]).features().is_none());
        assert!(Contour::from_xy(&[(0, 0), (5, 5), (10, 10)]).features().is_none());
    }

    #[test]
    fn normalized_round_trip_is_within_one_pixel() {
        let dims = FrameDims::new(640, 480);
        let original = Contour::from_xy(&[(0, 0), (639, 0), (639, 479), (13, 477), (321, 17)]);
        let back = original.normalize(dims).project(dims);
        for (a, b) in original.points.iter().zip(&back.points) {
            assert!((a.x - b.x).abs() <= 1 && (a.y - b.y).abs() <= 1);
        }
    }

    #[test]
    fn projection_clips_to_frame() {
        let n = NormalizedContour {
            points: vec![(-0.2, 1.5), (1.0, 1.0), (f64::NAN, 0.5)],
        };
        let c = n.project(FrameDims::new(100, 50));
        assert_eq!(c.points[0], Point::new(0, 49));
        assert_eq!(c.points[1], Point::new(99, 49));
        assert_eq!(c.points[2], Point::new(0, 25));
    }

    #[test]
    fn simplification_keeps_square_corners() {
        let mut pts = Vec::new();
        for x in 10..=40 {
            pts.push((x, 10));
        }
        for y in 11..=40 {
            pts.push((40, y));
        }
        for x in (10..40).rev() {
            pts.push((x, 40));
        }
        for y in (11..40).rev() {
            pts.push((10, y));
        }
        let dense = Contour::from_xy(&pts);
        let simple = dense.simplified(0.007);
        assert!(simple.len() <= 6, "got {} points", simple.len());
        assert!((simple.area() - dense.area()).abs() < 1e-9);
    }

    #[test]
    fn polygon_points_drop_closing_duplicate() {
        let c = Contour::from_xy(&[(0, 0), (4, 0), (4, 0), (4, 4), (0, 0)]);
        assert_eq!(c.polygon_points().len(), 3);
    }
}
