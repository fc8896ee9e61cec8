// THEORY:
// An `ActiveMaskSet` is one accepted selection: its contours, the color it is
// drawn in, and the query that produced it (recalibration reuses the query).
//
// Contours are stored twice: in pixel space at the resolution they were
// detected on, and normalized to [0, 1]. The normalized form is the durable
// one. Rendering needs pixel contours and a filled raster at whatever size the
// current frame has, so each set keeps a lazily built `RenderCache` keyed by
// frame dimensions. A frame of the same size reuses it; a frame of a new size
// rebuilds it by re-projecting the normalized contours.
//
// Sets are shared as `Arc<ActiveMaskSet>`. Recalibration never edits a set in
// place; it builds a replacement with the same id and color.

use crate::core_modules::contour::{Contour, FrameDims, NormalizedContour};
use crate::core_modules::raster::{self, Mask};
use image::{Luma, Rgb};
use imageproc::drawing::draw_polygon_mut;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Overlay colors, cycled per accepted selection.
pub const PALETTE: [Rgb<u8>; 7] = [
    Rgb([0, 255, 0]),
    Rgb([255, 0, 0]),
    Rgb([0, 0, 255]),
    Rgb([255, 255, 0]),
    Rgb([255, 0, 255]),
    Rgb([0, 255, 255]),
    Rgb([255, 165, 0]),
];

pub fn palette_color(cursor: usize) -> Rgb<u8> {
    PALETTE[cursor % PALETTE.len()]
}

/// Pixel-space geometry valid for exactly one frame size.
#[derive(Debug)]
pub struct RenderCache {
    pub dims: FrameDims,
    pub contours: Vec<Contour>,
    pub raster: Mask,
}

#[derive(Debug)]
pub struct ActiveMaskSet {
    pub id: u64,
    pub color: Rgb<u8>,
    pub query: String,
    pub source_dims: FrameDims,
    pub source_contours: Vec<Contour>,
    pub normalized: Vec<NormalizedContour>,
    cache: Mutex<Option<Arc<RenderCache>>>,
}

impl ActiveMaskSet {
    pub fn new(id: u64, color: Rgb<u8>, query: impl Into<String>, contours: Vec<Contour>, source_dims: FrameDims) -> Self {
        let normalized = contours.iter().map(|c| c.normalize(source_dims)).collect();
        Self {
            id,
            color,
            query: query.into(),
            source_dims,
            source_contours: contours,
            normalized,
            cache: Mutex::new(None),
        }
    }

    /// A replacement carrying the same identity, color and query.
    pub fn with_contours(&self, contours: Vec<Contour>, source_dims: FrameDims) -> Self {
        Self::new(self.id, self.color, self.query.clone(), contours, source_dims)
    }

    pub fn len(&self) -> usize {
        self.source_contours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source_contours.is_empty()
    }

    /// Geometry for a frame of `dims`, rebuilt only when the size changed.
    pub fn render_cache(&self, dims: FrameDims) -> Arc<RenderCache> {
        if let Some(cache) = self.cache.lock().as_ref() {
            if cache.dims == dims {
                return Arc::clone(cache);
            }
        }

        let contours: Vec<Contour> = if self.normalized.is_empty() {
            self.source_contours
                .iter()
                .map(|c| c.rescaled(self.source_dims, dims))
                .collect()
        } else {
            self.normalized.iter().map(|n| n.project(dims)).collect()
        };
        let raster = rasterize(&contours, dims);
        trace!(set = self.id, width = dims.width, height = dims.height, "render cache rebuilt");

        let cache = Arc::new(RenderCache { dims, contours, raster });
        *self.cache.lock() = Some(Arc::clone(&cache));
        cache
    }
}

/// Filled rasterization of every contour with at least three distinct vertices.
pub fn rasterize(contours: &[Contour], dims: FrameDims) -> Mask {
    let mut mask = raster::empty(dims);
    if dims.is_empty() {
        return mask;
    }
    for contour in contours {
        let points = contour.polygon_points();
        if points.len() >= 3 {
            draw_polygon_mut(&mut mask, &points, Luma([raster::ON]));
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_set() -> ActiveMaskSet {
        let square = Contour::from_xy(&[(50, 50), (149, 50), (149, 149), (50, 149)]);
        ActiveMaskSet::new(1, palette_color(0), "cells", vec![square], FrameDims::new(1000, 1000))
    }

    fn raster_box(mask: &Mask) -> (u32, u32, u32, u32) {
        let (mut x0, mut y0, mut x1, mut y1) = (u32::MAX, u32::MAX, 0, 0);
        for (x, y, p) in mask.enumerate_pixels() {
            if p[0] > 0 {
                x0 = x0.min(x);
                y0 = y0.min(y);
                x1 = x1.max(x);
                y1 = y1.max(y);
            }
        }
        (x0, y0, x1 - x0 + 1, y1 - y0 + 1)
    }

    #[test]
    fn same_size_reuses_cache() {
        let set = square_set();
        let dims = FrameDims::new(1000, 1000);
        let a = set.render_cache(dims);
        let b = set.render_cache(dims);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(raster::count(&a.raster), 10_000);
        assert_eq!(raster_box(&a.raster), (50, 50, 100, 100));
    }

    #[test]
    fn new_size_reprojects() {
        let set = square_set();
        let full = set.render_cache(FrameDims::new(1000, 1000));
        let half = set.render_cache(FrameDims::new(500, 500));
        assert!(!Arc::ptr_eq(&full, &half));
        let (x, y, w, h) = raster_box(&half.raster);
        assert!(x.abs_diff(25) <= 1 && y.abs_diff(25) <= 1);
        assert!(w.abs_diff(50) <= 1 && h.abs_diff(50) <= 1);
    }

    #[test]
    fn falls_back_to_direct_rescale() {
        let mut set = square_set();
        set.normalized.clear();
        let half = set.render_cache(FrameDims::new(500, 500));
        let (x, y, w, _) = raster_box(&half.raster);
        assert!(x.abs_diff(25) <= 1 && y.abs_diff(25) <= 1 && w.abs_diff(50) <= 1);
    }

    #[test]
    fn replacement_keeps_identity() {
        let set = square_set();
        let moved = set.with_contours(
            vec![Contour::from_xy(&[(60, 60), (159, 60), (159, 159), (60, 159)])],
            FrameDims::new(1000, 1000),
        );
        assert_eq!((moved.id, moved.color, moved.query.as_str()), (1, set.color, "cells"));
        assert_eq!(raster_box(&moved.render_cache(FrameDims::new(1000, 1000)).raster).0, 60);
    }

    #[test]
    fn degenerate_contours_are_skipped() {
        let line = Contour::from_xy(&[(0, 0), (10, 10), (0, 0)]);
        assert_eq!(raster::count(&rasterize(&[line], FrameDims::new(20, 20))), 0);
    }

    #[test]
    fn palette_cycles() {
        assert_eq!(palette_color(0), palette_color(PALETTE.len()));
        assert_ne!(palette_color(0), palette_color(1));
    }
}
