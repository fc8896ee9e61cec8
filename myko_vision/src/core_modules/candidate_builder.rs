// THEORY:
// No single threshold survives the variance of real microscope footage: stains
// shift, illumination drifts, and the same cell is dark on a bright-field slide
// and bright on a dark-field one. The candidate builder therefore computes
// several independent binary "cues", each from a different signal channel, and
// lets them vote.
//
// Cues:
// - Otsu: global split of contrast-stretched gray.
// - Adaptive: local-mean threshold on lightly blurred gray, holes filled.
// - Top-hat: the Otsu foreground minus its opening by the largest allowed
//   object size (keeps objects, drops large illumination plateaus).
// - Saturation: HSV saturation above the scene's typical level.
// - Stain: deviation of Lab a*/b* from the scene's median chroma.
// - Hue: saturated pixels whose hue departs from the dominant hue.
//
// The grayscale cues are polarity-adaptive: whichever side of the Otsu split
// is the minority inside the region of interest is treated as foreground.
// A cue only takes part in the vote when its channel carries signal inside
// the region (a grayscale slide has no saturation to vote with). A pixel is
// foreground when `min(min_votes, applicable)` cues agree.
//
// After voting, one opening and one closing remove speckle and fill pinholes,
// and any component that leans on the field-of-view rim is discarded.

pub mod candidate_builder {
    use crate::config::DetectionConfig;
    use crate::core_modules::contour::FrameDims;
    use crate::core_modules::pixel::pixel::{Pixel, hue_distance};
    use crate::core_modules::query::RegionOfInterest;
    use crate::core_modules::raster::{self, Mask};
    use image::imageops::grayscale;
    use image::{GrayImage, Luma, RgbImage};
    use imageproc::contrast::otsu_level;
    use imageproc::distance_transform::Norm;
    use imageproc::filter::{box_filter, gaussian_blur_f32};
    use imageproc::morphology::{close, open};
    use imageproc::region_labelling::{Connectivity, connected_components};
    use tracing::trace;

    const SATURATION_FLOOR: u8 = 25;
    const STAIN_FLOOR: u8 = 18;
    const MIN_CHANNEL_SPREAD: u8 = 12;
    const MIN_STAIN_SPREAD: u8 = 6;
    const HUE_MIN_SATURATION: u8 = 30;
    const HUE_MAX_DEVIATION: f32 = 25.0;
    const HUE_MIN_PIXELS: usize = 64;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Cue {
        Otsu,
        Adaptive,
        TopHat,
        Saturation,
        Stain,
        Hue,
    }

    /// The fused foreground map plus which cues produced it.
    #[derive(Debug, Clone)]
    pub struct Foreground {
        pub mask: Mask,
        pub cues: Vec<Cue>,
        pub required_votes: usize,
    }

    impl Foreground {
        fn empty(dims: FrameDims) -> Self {
            Self {
                mask: raster::empty(dims),
                cues: Vec::new(),
                required_votes: 0,
            }
        }
    }

    /// The field of view restricted to the query's region.
    pub fn region_mask(fov: &Mask, region: RegionOfInterest) -> Mask {
        if region.is_full() {
            return fov.clone();
        }
        let (w, h) = fov.dimensions();
        raster::from_fn(FrameDims::new(w, h), |x, y| {
            raster::is_on(fov, x, y) && region.contains(x, y, w, h)
        })
    }

    pub fn build_foreground(
        frame: &RgbImage,
        fov: &Mask,
        region: RegionOfInterest,
        config: &DetectionConfig,
    ) -> Foreground {
        let dims = FrameDims::of(frame);
        let roi = region_mask(fov, region);
        if raster::count(&roi) == 0 {
            return Foreground::empty(dims);
        }

        let mut cues: Vec<(Cue, Mask)> = Vec::with_capacity(6);

        let gray = grayscale(frame);
        if let Some(stretched) = stretch_contrast(&gray, &roi) {
            if let Some((level, bright)) = otsu_split(&stretched, &roi) {
                let otsu = raster::from_fn(dims, |x, y| {
                    let v = stretched.get_pixel(x, y)[0];
                    if bright { v > level } else { v <= level }
                });
                let adaptive = adaptive_cue(&stretched, bright, config);
                let top_hat = top_hat_cue(&otsu, dims, config);
                cues.push((Cue::Otsu, otsu));
                cues.push((Cue::Adaptive, adaptive));
                cues.push((Cue::TopHat, top_hat));
            }
        }

        let pixels: Vec<Pixel> = frame.pixels().map(Pixel::from_rgb).collect();
        let saturation: Vec<u8> = pixels.iter().map(Pixel::saturation).collect();
        if let Some(mask) = saturation_cue(&saturation, &roi, dims) {
            cues.push((Cue::Saturation, mask));
        }
        if let Some(mask) = stain_cue(&pixels, &roi, dims) {
            cues.push((Cue::Stain, mask));
        }
        if let Some(mask) = hue_cue(&pixels, &saturation, &roi, dims) {
            cues.push((Cue::Hue, mask));
        }

        if cues.is_empty() {
            trace!("no applicable cue inside the region");
            return Foreground::empty(dims);
        }

        let required = config.min_votes.min(cues.len()).max(1);
        let mut votes = vec![0u8; (dims.width * dims.height) as usize];
        for (_, mask) in &cues {
            for (vote, &p) in votes.iter_mut().zip(mask.as_raw()) {
                if p > 0 {
                    *vote += 1;
                }
            }
        }
        let roi_raw = roi.as_raw();
        let voted = raster::from_fn(dims, |x, y| {
            let i = (y * dims.width + x) as usize;
            roi_raw[i] > 0 && votes[i] as usize >= required
        });

        let cleaned = close(&open(&voted, Norm::LInf, 1), Norm::L1, 2);
        let band = raster::inner_band(fov, config.rim_band_radius);
        let mask = reject_rim_components(&cleaned, &band, config.rim_overlap_max);

        let names: Vec<Cue> = cues.iter().map(|(cue, _)| *cue).collect();
        trace!(cues = ?names, required, "foreground voted");
        Foreground {
            mask,
            cues: names,
            required_votes: required,
        }
    }

    /// Linear stretch of the ROI's 1st..99th percentile onto 0..255. Falls back
    /// to min..max; `None` for a flat region.
    fn stretch_contrast(gray: &GrayImage, roi: &Mask) -> Option<GrayImage> {
        let pct = |p: f64| raster::percentile_u8(gray.as_raw().iter(), Some(roi), p);
        let (mut lo, mut hi) = (pct(1.0)?, pct(99.0)?);
        if hi <= lo {
            (lo, hi) = (pct(0.0)?, pct(100.0)?);
        }
        if hi <= lo {
            return None;
        }

        let span = (hi - lo) as f32;
        let mut lut = [0u8; 256];
        for (v, slot) in lut.iter_mut().enumerate() {
            let t = (v as f32 - lo as f32) / span;
            *slot = (t.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
        let mut out = gray.clone();
        for p in out.iter_mut() {
            *p = lut[*p as usize];
        }
        Some(out)
    }

    /// Otsu level over the ROI and whether the bright side is the minority.
    fn otsu_split(stretched: &GrayImage, roi: &Mask) -> Option<(u8, bool)> {
        let values: Vec<u8> = stretched
            .as_raw()
            .iter()
            .zip(roi.as_raw())
            .filter(|&(_, &m)| m > 0)
            .map(|(&v, _)| v)
            .collect();
        let n = values.len();
        let row = GrayImage::from_raw(n as u32, 1, values)?;
        let level = otsu_level(&row);
        let above = row.as_raw().iter().filter(|&&v| v > level).count();
        let below = n - above;
        if above == 0 || below == 0 {
            return None;
        }
        Some((level, above <= below))
    }

    fn adaptive_cue(stretched: &GrayImage, bright: bool, config: &DetectionConfig) -> Mask {
        let blurred = gaussian_blur_f32(stretched, 1.0);
        let r = config.adaptive_radius.max(1);
        let mean = box_filter(&blurred, r, r);
        let offset = config.adaptive_offset;
        let raw: Vec<u8> = blurred
            .as_raw()
            .iter()
            .zip(mean.as_raw())
            .map(|(&b, &m)| {
                let (b, m) = (b as i16, m as i16);
                let on = if bright { b > m + offset } else { b < m - offset };
                if on { raster::ON } else { raster::OFF }
            })
            .collect();
        match GrayImage::from_raw(blurred.width(), blurred.height(), raw) {
            Some(mask) => raster::fill_holes(&mask),
            None => raster::empty(FrameDims::of(stretched)),
        }
    }

    fn top_hat_cue(otsu: &Mask, dims: FrameDims, config: &DetectionConfig) -> Mask {
        let max_area = config.max_area_fraction * dims.area();
        let radius = ((max_area.sqrt() / 2.0).ceil() + 1.0).clamp(1.0, 255.0) as u8;
        raster::subtract(otsu, &open(otsu, Norm::LInf, radius))
    }

    fn saturation_cue(saturation: &[u8], roi: &Mask, dims: FrameDims) -> Option<Mask> {
        let pct = |p: f64| raster::percentile_u8(saturation.iter(), Some(roi), p);
        let (low, high) = (pct(5.0)?, pct(99.0)?);
        if high.saturating_sub(low) < MIN_CHANNEL_SPREAD {
            return None;
        }
        let threshold = pct(60.0)?.max(SATURATION_FLOOR);
        Some(raster::from_fn(dims, |x, y| {
            saturation[(y * dims.width + x) as usize] > threshold
        }))
    }

    fn stain_cue(pixels: &[Pixel], roi: &Mask, dims: FrameDims) -> Option<Mask> {
        let chroma: Vec<(f32, f32)> = pixels.iter().map(Pixel::lab_ab).collect();
        let inside = |i: usize| roi.as_raw()[i] > 0;

        let mut a: Vec<f32> = Vec::new();
        let mut b: Vec<f32> = Vec::new();
        for (i, &(ca, cb)) in chroma.iter().enumerate() {
            if inside(i) {
                a.push(ca);
                b.push(cb);
            }
        }
        let (median_a, median_b) = (median(&mut a)?, median(&mut b)?);

        let deviation: Vec<u8> = chroma
            .iter()
            .map(|&(ca, cb)| ((ca - median_a).abs() + (cb - median_b).abs()).round().clamp(0.0, 255.0) as u8)
            .collect();
        let pct = |p: f64| raster::percentile_u8(deviation.iter(), Some(roi), p);
        if pct(99.0)? < MIN_STAIN_SPREAD {
            return None;
        }
        let threshold = pct(70.0)?.max(STAIN_FLOOR);
        Some(raster::from_fn(dims, |x, y| {
            deviation[(y * dims.width + x) as usize] > threshold
        }))
    }

    fn hue_cue(pixels: &[Pixel], saturation: &[u8], roi: &Mask, dims: FrameDims) -> Option<Mask> {
        let roi_raw = roi.as_raw();
        let roi_count = raster::count(roi);
        let hues: Vec<Option<f32>> = pixels
            .iter()
            .zip(saturation)
            .zip(roi_raw)
            .map(|((p, &s), &m)| (m > 0 && s >= HUE_MIN_SATURATION).then(|| p.hue()))
            .collect();

        let saturated = hues.iter().flatten().count();
        if saturated < HUE_MIN_PIXELS || saturated * 100 < roi_count {
            return None;
        }

        let (mut sin, mut cos) = (0.0f64, 0.0f64);
        for h in hues.iter().flatten() {
            let rad = (*h as f64).to_radians();
            sin += rad.sin();
            cos += rad.cos();
        }
        let mut dominant = sin.atan2(cos).to_degrees() as f32;
        if dominant < 0.0 {
            dominant += 360.0;
        }

        Some(raster::from_fn(dims, |x, y| {
            hues[(y * dims.width + x) as usize].is_some_and(|h| hue_distance(h, dominant) > HUE_MAX_DEVIATION)
        }))
    }

    fn median(values: &mut [f32]) -> Option<f32> {
        if values.is_empty() {
            return None;
        }
        let mid = values.len() / 2;
        let (_, m, _) = values.select_nth_unstable_by(mid, f32::total_cmp);
        Some(*m)
    }

    /// Drops every 8-connected component with more than `max_overlap` of its
    /// area inside `band`.
    pub fn reject_rim_components(mask: &Mask, band: &Mask, max_overlap: f64) -> Mask {
        if raster::count(band) == 0 {
            return mask.clone();
        }
        let labels = connected_components(mask, Connectivity::Eight, Luma([raster::OFF]));
        let stats = raster::label_stats(&labels);
        let mut overlap = vec![0usize; stats.len()];
        for (&label, &b) in labels.as_raw().iter().zip(band.as_raw()) {
            if label != 0 && b > 0 {
                overlap[label as usize] += 1;
            }
        }
        let keep: Vec<bool> = stats
            .iter()
            .zip(&overlap)
            .map(|(s, &o)| s.area > 0 && (o as f64) <= max_overlap * s.area as f64)
            .collect();

        let (w, h) = mask.dimensions();
        raster::from_fn(FrameDims::new(w, h), |x, y| {
            let label = labels.get_pixel(x, y)[0];
            label != 0 && keep[label as usize]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::candidate_builder::*;
    use crate::config::DetectionConfig;
    use crate::core_modules::contour::FrameDims;
    use crate::core_modules::query::{QueryIntent, RegionOfInterest};
    use crate::core_modules::raster;
    use image::{Rgb, RgbImage};

    fn square_frame(size: u32, x0: u32, y0: u32, side: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if (x0..x0 + side).contains(&x) && (y0..y0 + side).contains(&y) {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    #[test]
    fn bright_square_on_black_is_foreground() {
        let frame = square_frame(200, 60, 60, 20);
        let fov = raster::full(FrameDims::of(&frame));
        let fg = build_foreground(&frame, &fov, RegionOfInterest::default(), &DetectionConfig::default());
        assert_eq!(fg.cues, vec![Cue::Otsu, Cue::Adaptive, Cue::TopHat]);
        assert_eq!(fg.required_votes, 3);
        let n = raster::count(&fg.mask);
        assert!((380..=420).contains(&n), "foreground has {n} px");
        assert!(raster::is_on(&fg.mask, 70, 70));
        assert!(!raster::is_on(&fg.mask, 10, 10));
    }

    #[test]
    fn stained_disc_on_gray_slide() {
        let frame = RgbImage::from_fn(100, 100, |x, y| {
            let dx = x as f64 - 50.0;
            let dy = y as f64 - 50.0;
            if dx * dx + dy * dy <= 64.0 { Rgb([180, 60, 140]) } else { Rgb([200, 200, 200]) }
        });
        let fov = raster::full(FrameDims::of(&frame));
        let fg = build_foreground(&frame, &fov, RegionOfInterest::default(), &DetectionConfig::default());
        assert!(fg.cues.contains(&Cue::Saturation));
        assert!(fg.cues.contains(&Cue::Stain));
        assert!(raster::is_on(&fg.mask, 50, 50));
        assert!(!raster::is_on(&fg.mask, 5, 5));
    }

    #[test]
    fn flat_frame_has_no_foreground() {
        let frame = RgbImage::from_pixel(50, 50, Rgb([90, 90, 90]));
        let fov = raster::full(FrameDims::of(&frame));
        let fg = build_foreground(&frame, &fov, RegionOfInterest::default(), &DetectionConfig::default());
        assert!(fg.cues.is_empty());
        assert_eq!(raster::count(&fg.mask), 0);
    }

    #[test]
    fn region_keywords_restrict_foreground() {
        let frame = RgbImage::from_fn(200, 200, |x, y| {
            let left = (30..50).contains(&x) && (90..110).contains(&y);
            let right = (150..170).contains(&x) && (90..110).contains(&y);
            if left || right { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) }
        });
        let fov = raster::full(FrameDims::of(&frame));
        let region = QueryIntent::parse("cells on the left").region;
        let fg = build_foreground(&frame, &fov, region, &DetectionConfig::default());
        assert!(raster::is_on(&fg.mask, 40, 100));
        assert!(!raster::is_on(&fg.mask, 160, 100));
    }

    #[test]
    fn rim_components_are_rejected() {
        let dims = FrameDims::new(40, 40);
        let band = raster::from_fn(dims, |x, _| x < 4);
        let mask = raster::from_fn(dims, |x, y| {
            let on_rim = (2..10).contains(&x) && (2..10).contains(&y);
            let inside = (20..30).contains(&x) && (20..30).contains(&y);
            on_rim || inside
        });
        let kept = reject_rim_components(&mask, &band, 0.08);
        assert!(!raster::is_on(&kept, 5, 5));
        assert!(raster::is_on(&kept, 25, 25));
        assert_eq!(raster::count(&kept), 100);
    }
}
