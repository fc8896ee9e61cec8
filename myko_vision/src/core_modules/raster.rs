// Binary mask helpers shared by the detection stages.
//
// A `Mask` is a `GrayImage` holding 0 (off) or 255 (on), the convention the
// `imageproc` morphology and labelling functions expect.

use crate::core_modules::contour::FrameDims;
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;
use imageproc::region_labelling::{Connectivity, connected_components};

pub type Mask = GrayImage;
pub type Labels = ImageBuffer<Luma<u32>, Vec<u32>>;

pub const ON: u8 = 255;
pub const OFF: u8 = 0;

pub fn empty(dims: FrameDims) -> Mask {
    GrayImage::new(dims.width, dims.height)
}

pub fn full(dims: FrameDims) -> Mask {
    GrayImage::from_pixel(dims.width, dims.height, Luma([ON]))
}

/// Builds a mask from a per-pixel predicate.
pub fn from_fn(dims: FrameDims, mut on: impl FnMut(u32, u32) -> bool) -> Mask {
    GrayImage::from_fn(dims.width, dims.height, |x, y| {
        Luma([if on(x, y) { ON } else { OFF }])
    })
}

pub fn count(mask: &Mask) -> usize {
    mask.as_raw().iter().filter(|&&v| v > 0).count()
}

pub fn is_on(mask: &Mask, x: u32, y: u32) -> bool {
    mask.as_raw()[(y * mask.width() + x) as usize] > 0
}

/// Pixels on in `a` and off in `b`.
pub fn subtract(a: &Mask, b: &Mask) -> Mask {
    zip(a, b, |x, y| x && !y)
}

pub fn invert(mask: &Mask) -> Mask {
    let raw = mask.as_raw().iter().map(|&v| if v > 0 { OFF } else { ON }).collect();
    GrayImage::from_raw(mask.width(), mask.height(), raw).unwrap_or_else(|| empty(FrameDims::of(mask)))
}

fn zip(a: &Mask, b: &Mask, op: impl Fn(bool, bool) -> bool) -> Mask {
    let raw = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| if op(x > 0, y > 0) { ON } else { OFF })
        .collect();
    GrayImage::from_raw(a.width(), a.height(), raw).unwrap_or_else(|| empty(FrameDims::of(a)))
}

/// The band of width `radius` just inside the mask boundary.
pub fn inner_band(mask: &Mask, radius: u8) -> Mask {
    if radius == 0 {
        return empty(FrameDims::of(mask));
    }
    subtract(mask, &erode(mask, Norm::L1, radius))
}

/// Sets every background region that does not touch the image border.
pub fn fill_holes(mask: &Mask) -> Mask {
    let (w, h) = mask.dimensions();
    if w == 0 || h == 0 {
        return mask.clone();
    }
    let background = invert(mask);
    let labels = connected_components(&background, Connectivity::Four, Luma([OFF]));
    let max_label = labels.as_raw().iter().copied().max().unwrap_or(0) as usize;
    let mut touches_border = vec![false; max_label + 1];
    for x in 0..w {
        touches_border[labels.get_pixel(x, 0)[0] as usize] = true;
        touches_border[labels.get_pixel(x, h - 1)[0] as usize] = true;
    }
    for y in 0..h {
        touches_border[labels.get_pixel(0, y)[0] as usize] = true;
        touches_border[labels.get_pixel(w - 1, y)[0] as usize] = true;
    }

    let mut out = mask.clone();
    for (o, &label) in out.iter_mut().zip(labels.as_raw()) {
        if label != 0 && !touches_border[label as usize] {
            *o = ON;
        }
    }
    out
}

/// Per-label pixel statistics of a label map.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelStats {
    pub area: usize,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl LabelStats {
    fn include(&mut self, x: u32, y: u32) {
        if self.area == 0 {
            (self.min_x, self.min_y, self.max_x, self.max_y) = (x, y, x, y);
        } else {
            self.min_x = self.min_x.min(x);
            self.min_y = self.min_y.min(y);
            self.max_x = self.max_x.max(x);
            self.max_y = self.max_y.max(y);
        }
        self.area += 1;
    }
}

/// Stats for labels 0..=max; index 0 is the background.
pub fn label_stats(labels: &Labels) -> Vec<LabelStats> {
    let max_label = labels.as_raw().iter().copied().max().unwrap_or(0) as usize;
    let mut stats = vec![LabelStats::default(); max_label + 1];
    for (x, y, p) in labels.enumerate_pixels() {
        stats[p[0] as usize].include(x, y);
    }
    stats
}

/// The `p`-th percentile (0..=100) of the values selected by `mask`, or
/// `None` when nothing is selected.
pub fn percentile_u8<'a>(values: impl Iterator<Item = &'a u8>, mask: Option<&Mask>, p: f64) -> Option<u8> {
    let mut histogram = [0usize; 256];
    let mut total = 0usize;
    match mask {
        Some(mask) => {
            for (&v, &m) in values.zip(mask.as_raw()) {
                if m > 0 {
                    histogram[v as usize] += 1;
                    total += 1;
                }
            }
        }
        None => {
            for &v in values {
                histogram[v as usize] += 1;
                total += 1;
            }
        }
    }
    if total == 0 {
        return None;
    }
    let rank = ((p.clamp(0.0, 100.0) / 100.0) * (total - 1) as f64).round() as usize;
    let mut seen = 0usize;
    for (value, &n) in histogram.iter().enumerate() {
        seen += n;
        if seen > rank {
            return Some(value as u8);
        }
    }
    Some(255)
}
