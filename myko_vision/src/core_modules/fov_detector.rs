// THEORY:
// Microscope cameras see the optics through a circular (sometimes
// rectangular) aperture. Everything outside it is near-black vignette, and
// the ring just inside it is full of glare and edge artifacts. The field of
// view detector finds that aperture so later stages can ignore the rest.
//
// Algorithm:
// 1. Threshold the grayscale frame at a low percentile (never below a floor).
// 2. Close small gaps twice so dust on the rim does not break the disc apart.
// 3. Keep the 8-connected component under the frame center, or the largest one
//    if the center is dark.
// 4. Fill interior holes (dark cells inside the viewport are still "inside").
// 5. Erode by a margin proportional to the frame size.
//
// The output is never empty: when no distinct viewport exists (all-black,
// all-white, or a component too small to be an aperture) it is the full frame.

pub mod fov_detector {
    use crate::config::DetectionConfig;
    use crate::core_modules::contour::FrameDims;
    use crate::core_modules::raster::{self, Mask};
    use image::{GrayImage, Luma};
    use imageproc::distance_transform::Norm;
    use imageproc::morphology::{close, erode};
    use imageproc::region_labelling::{Connectivity, connected_components};
    use tracing::trace;

    pub fn detect_field_of_view(gray: &GrayImage, config: &DetectionConfig) -> Mask {
        let dims = FrameDims::of(gray);
        if dims.is_empty() {
            return raster::empty(dims);
        }

        let percentile = raster::percentile_u8(gray.as_raw().iter(), None, config.fov_percentile).unwrap_or(0);
        let threshold = percentile.max(config.fov_min_threshold);
        let candidate = raster::from_fn(dims, |x, y| gray.get_pixel(x, y)[0] > threshold);

        let radius = config.fov_close_radius;
        let closed = if radius > 0 {
            close(&close(&candidate, Norm::L1, radius), Norm::L1, radius)
        } else {
            candidate
        };

        let Some(component) = viewport_component(&closed) else {
            trace!("no viewport component; using the full frame");
            return raster::full(dims);
        };
        let coverage = raster::count(&component) as f64 / dims.area();
        if coverage < config.fov_min_coverage {
            trace!(coverage, "viewport component too small; using the full frame");
            return raster::full(dims);
        }

        let filled = raster::fill_holes(&component);
        let margin = (config.fov_margin_fraction * dims.min_side() as f64).round().max(3.0).min(255.0) as u8;
        let eroded = erode(&filled, Norm::L1, margin);
        if raster::count(&eroded) == 0 {
            filled
        } else {
            eroded
        }
    }

    /// The component under the center pixel, or the largest one.
    fn viewport_component(mask: &Mask) -> Option<Mask> {
        let labels = connected_components(mask, Connectivity::Eight, Luma([raster::OFF]));
        let stats = raster::label_stats(&labels);
        if stats.len() <= 1 {
            return None;
        }

        let (w, h) = labels.dimensions();
        let center = labels.get_pixel(w / 2, h / 2)[0];
        let chosen = if center != 0 {
            center
        } else {
            stats
                .iter()
                .enumerate()
                .skip(1)
                .max_by_key(|(_, s)| s.area)
                .map(|(label, _)| label as u32)?
        };

        Some(raster::from_fn(FrameDims::new(w, h), |x, y| labels.get_pixel(x, y)[0] == chosen))
    }
}
