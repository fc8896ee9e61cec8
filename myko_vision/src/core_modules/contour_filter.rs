// THEORY:
// The contour filter turns a label map into clean instance boundaries. It is
// the last stage of the fast detection path and the gatekeeper against
// degenerate geometry: anything that survives it has a finite centroid, a
// plausible size, and a reasonably round, solid outline.
//
// Per label:
// 1. One pass over the label map collects pixel count, bounding box and
//    overlap with the field-of-view rim band for every label at once.
// 2. Labels far outside the area window are skipped before any tracing.
// 3. The label is cropped (1 px padding) and its outer border traced.
// 4. Area, circularity, solidity and rim overlap are checked.
// 5. Near-duplicates are merged on a coarse centroid grid.
// 6. The survivor is simplified to a few vertices.

pub mod contour_filter {
    use crate::config::DetectionConfig;
    use crate::core_modules::contour::{Contour, FrameDims, PixelPoint};
    use crate::core_modules::instance_separator::instance_separator::LabelMap;
    use crate::core_modules::raster::{self, Mask};
    use image::{GrayImage, Luma};
    use imageproc::contours::{BorderType, find_contours};
    use imageproc::point::Point;
    use std::collections::HashSet;
    use tracing::debug;

    /// Area window in polygon pixels for a frame of `dims`.
    pub fn area_bounds(dims: FrameDims, config: &DetectionConfig) -> (f64, f64) {
        let area = dims.area();
        let min = (config.min_area_fraction * area).max(config.min_area_px);
        let max = config.max_area_fraction * area;
        (min, max)
    }

    pub fn extract_contours(labels: &LabelMap, fov: &Mask, config: &DetectionConfig) -> Vec<Contour> {
        if labels.count == 0 {
            return Vec::new();
        }
        let dims = labels.dims();
        let (min_area, max_area) = area_bounds(dims, config);

        let stats = raster::label_stats(&labels.labels);
        let band = raster::inner_band(fov, config.contour_rim_radius);
        let mut rim = vec![0usize; stats.len()];
        for (&label, &b) in labels.labels.as_raw().iter().zip(band.as_raw()) {
            if label != 0 && b > 0 {
                rim[label as usize] += 1;
            }
        }

        let mut seen_cells: HashSet<(i32, i32)> = HashSet::new();
        let mut out = Vec::new();
        let mut rejected = 0usize;
        for (label, s) in stats.iter().enumerate().skip(1) {
            let pixels = s.area as f64;
            if pixels == 0.0 || pixels < min_area * 0.5 || pixels > max_area * 2.0 {
                rejected += 1;
                continue;
            }
            if rim[label] as f64 > config.rim_overlap_max * pixels {
                rejected += 1;
                continue;
            }
            let Some(contour) = trace_label(labels, label as u32, s) else {
                rejected += 1;
                continue;
            };
            let Some(features) = contour.features() else {
                rejected += 1;
                continue;
            };
            if features.area < min_area
                || features.area > max_area
                || features.circularity < config.min_circularity
                || features.solidity < config.min_solidity
            {
                rejected += 1;
                continue;
            }

            let grid = config.dedup_grid.max(1);
            let cell = (features.center.0.div_euclid(grid), features.center.1.div_euclid(grid));
            if !seen_cells.insert(cell) {
                rejected += 1;
                continue;
            }
            out.push(contour.simplified(config.simplify_tolerance));
        }

        debug!(kept = out.len(), rejected, "contours filtered");
        out
    }

    /// The largest outer border of one label, in frame coordinates.
    fn trace_label(labels: &LabelMap, label: u32, s: &raster::LabelStats) -> Option<Contour> {
        let width = s.max_x - s.min_x + 3;
        let height = s.max_y - s.min_y + 3;
        let crop = GrayImage::from_fn(width, height, |x, y| {
            let inside = x >= 1 && y >= 1 && x < width - 1 && y < height - 1;
            let on = inside && labels.labels.get_pixel(s.min_x + x - 1, s.min_y + y - 1)[0] == label;
            Luma([if on { raster::ON } else { raster::OFF }])
        });

        let (ox, oy) = (s.min_x as i32 - 1, s.min_y as i32 - 1);
        find_contours::<i32>(&crop)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer)
            .map(|c| {
                Contour::new(
                    c.points
                        .iter()
                        .map(|p| -> PixelPoint { Point::new(p.x + ox, p.y + oy) })
                        .collect(),
                )
            })
            .max_by(|a, b| a.area().total_cmp(&b.area()))
    }
}

#[cfg(test)]
mod tests {
    use super::contour_filter::*;
    use crate::config::DetectionConfig;
    use crate::core_modules::contour::{BoundingBox, FrameDims};
    use crate::core_modules::instance_separator::instance_separator::separate_instances;
    use crate::core_modules::raster;

    #[test]
    fn square_instance_survives_with_exact_box() {
        let dims = FrameDims::new(1000, 1000);
        let mask = raster::from_fn(dims, |x, y| (50..150).contains(&x) && (50..150).contains(&y));
        let config = DetectionConfig::default();
        let labels = separate_instances(&mask, &config);
        let contours = extract_contours(&labels, &raster::full(dims), &config);
        assert_eq!(contours.len(), 1);
        let f = contours[0].features().unwrap();
        assert!((f.area - 10_000.0).abs() < 1_000.0);
        assert!((f.circularity - 0.785).abs() < 0.05);
        assert_eq!(
            f.bbox,
            BoundingBox {
                x: 50,
                y: 50,
                width: 100,
                height: 100
            }
        );
    }

    #[test]
    fn thin_lines_and_specks_are_rejected() {
        let dims = FrameDims::new(400, 400);
        let mask = raster::from_fn(dims, |x, y| {
            let line = (20..220).contains(&x) && (10..13).contains(&y);
            let speck = (300..302).contains(&x) && (300..302).contains(&y);
            line || speck
        });
        let config = DetectionConfig::default();
        let labels = separate_instances(&mask, &config);
        assert!(extract_contours(&labels, &raster::full(dims), &config).is_empty());
    }

    #[test]
    fn instances_on_the_rim_are_rejected() {
        let dims = FrameDims::new(300, 300);
        let fov = raster::from_fn(dims, |x, _| x >= 20);
        let mask = raster::from_fn(dims, |x, y| {
            let on_rim = (20..40).contains(&x) && (100..120).contains(&y);
            let inside = (150..170).contains(&x) && (100..120).contains(&y);
            on_rim || inside
        });
        let config = DetectionConfig::default();
        let labels = separate_instances(&mask, &config);
        let contours = extract_contours(&labels, &fov, &config);
        assert_eq!(contours.len(), 1);
        assert_eq!(contours[0].bounding_box().unwrap().x, 150);
    }

    #[test]
    fn area_bounds_scale_with_frame() {
        let config = DetectionConfig::default();
        let (min_small, max_small) = area_bounds(FrameDims::new(100, 100), &config);
        assert!((min_small - 12.0).abs() < 1e-9);
        assert!((max_small - 300.0).abs() < 1e-9);
        let (min_big, _) = area_bounds(FrameDims::new(2000, 2000), &config);
        assert!((min_big - 48.0).abs() < 1e-9);
    }
}
