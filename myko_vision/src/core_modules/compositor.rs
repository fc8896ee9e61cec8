// THEORY:
// The compositor is the last pixel stage before a frame leaves the engine. It
// never touches the incoming frame: it works on a copy, blends each set's fill
// color into the pixels its raster covers, then outlines each set's contours.
// Sets drawn later win where fills overlap. Outline thickness scales with the
// frame so overlays look the same at any stream resolution.

use crate::core_modules::contour::FrameDims;
use crate::core_modules::mask_cache::ActiveMaskSet;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct OverlayStyle {
    /// Weight of the fill color in the blend.
    pub fill_alpha: f32,
    /// Outline thickness as a fraction of the shorter frame side.
    pub outline_fraction: f64,
}

impl OverlayStyle {
    pub fn outline_thickness(&self, dims: FrameDims) -> u32 {
        ((self.outline_fraction * dims.min_side() as f64).round() as u32).max(1)
    }
}

pub fn composite(frame: &RgbImage, sets: &[Arc<ActiveMaskSet>], style: OverlayStyle) -> RgbImage {
    let mut out = frame.clone();
    if sets.is_empty() {
        return out;
    }
    let dims = FrameDims::of(frame);
    let caches: Vec<_> = sets.iter().map(|set| (set.color, set.render_cache(dims))).collect();

    // Combined fill layer; later sets override earlier ones.
    let mut fill: Vec<Option<Rgb<u8>>> = vec![None; (dims.width * dims.height) as usize];
    for (color, cache) in &caches {
        for (slot, &p) in fill.iter_mut().zip(cache.raster.as_raw()) {
            if p > 0 {
                *slot = Some(*color);
            }
        }
    }

    let alpha = style.fill_alpha.clamp(0.0, 1.0);
    for (pixel, layer) in out.pixels_mut().zip(&fill) {
        if let Some(color) = layer {
            for c in 0..3 {
                let blended = (1.0 - alpha) * pixel[c] as f32 + alpha * color[c] as f32;
                pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    let thickness = style.outline_thickness(dims) as i32;
    let lo = -(thickness - 1) / 2;
    let hi = thickness / 2;
    for (color, cache) in &caches {
        for contour in &cache.contours {
            let points = contour.polygon_points();
            if points.len() < 2 {
                continue;
            }
            for (i, a) in points.iter().enumerate() {
                let b = points[(i + 1) % points.len()];
                for dy in lo..=hi {
                    for dx in lo..=hi {
                        draw_line_segment_mut(
                            &mut out,
                            ((a.x + dx) as f32, (a.y + dy) as f32),
                            ((b.x + dx) as f32, (b.y + dy) as f32),
                            *color,
                        );
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::contour::Contour;
    use crate::core_modules::mask_cache::palette_color;

    fn style() -> OverlayStyle {
        OverlayStyle {
            fill_alpha: 0.45,
            outline_fraction: 0.003,
        }
    }

    fn set(id: u64, cursor: usize, x0: i32) -> Arc<ActiveMaskSet> {
        let square = Contour::from_xy(&[(x0, 20), (x0 + 39, 20), (x0 + 39, 59), (x0, 59)]);
        Arc::new(ActiveMaskSet::new(id, palette_color(cursor), "cells", vec![square], FrameDims::new(200, 100)))
    }

    #[test]
    fn fill_and_outline_only_where_masked() {
        let frame = RgbImage::new(200, 100);
        let out = composite(&frame, &[set(1, 0, 20)], style());
        assert_eq!(out.get_pixel(40, 40), &Rgb([0, 115, 0]));
        assert_eq!(out.get_pixel(20, 20), &Rgb([0, 255, 0]));
        assert_eq!(out.get_pixel(5, 5), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(150, 40), &Rgb([0, 0, 0]));
        // The source frame is untouched.
        assert_eq!(frame.get_pixel(40, 40), &Rgb([0, 0, 0]));
    }

    #[test]
    fn later_sets_win_overlaps() {
        let frame = RgbImage::new(200, 100);
        let out = composite(&frame, &[set(1, 0, 20), set(2, 1, 40)], style());
        assert_eq!(out.get_pixel(50, 40), &Rgb([115, 0, 0]));
        assert_eq!(out.get_pixel(30, 40), &Rgb([0, 115, 0]));
    }

    #[test]
    fn outline_scales_with_frame() {
        let s = style();
        assert_eq!(s.outline_thickness(FrameDims::new(200, 100)), 1);
        assert_eq!(s.outline_thickness(FrameDims::new(1920, 1080)), 3);
    }

    #[test]
    fn no_sets_is_a_plain_copy() {
        let frame = RgbImage::from_pixel(10, 10, Rgb([1, 2, 3]));
        assert_eq!(composite(&frame, &[], style()), frame);
    }
}
