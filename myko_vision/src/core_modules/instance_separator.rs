// THEORY:
// The candidate builder hands over one binary foreground map in which touching
// cells are merged into single blobs. The instance separator splits those
// blobs the way the spatial layer grows blobs from heat peaks: find the
// "hottest" points, then grow regions outward from them.
//
// Here the heat is the Euclidean distance of every foreground pixel to the
// nearest background pixel. Cell centers are distance peaks, and the necks
// between touching cells are distance saddles.
//
// Three tiers, in order of precision:
// 1. Watershed: local maxima of the distance map (at least `peak_min_distance`
//    apart) become markers, which are flooded downhill in priority order,
//    restricted to the foreground. Neighboring basins whose shared saddle is
//    barely below their peaks are merged back together (a single blob with a
//    rippled medial ridge must not be split).
// 2. Core threshold: connected components of the distance map above
//    `core_threshold` of its peak become the markers instead.
// 3. Plain connected components of the foreground.
//
// A tier that produces no markers falls through to the next one, so the
// separator degrades in precision but never fails.

pub mod instance_separator {
    use crate::config::{DetectionConfig, SeparatorMode};
    use crate::core_modules::contour::FrameDims;
    use crate::core_modules::raster::{self, Labels, Mask};
    use image::Luma;
    use imageproc::distance_transform::euclidean_squared_distance_transform;
    use imageproc::region_labelling::{Connectivity, connected_components};
    use std::cmp::Reverse;
    use std::collections::{BinaryHeap, HashMap};
    use tracing::{debug, trace};

    /// Basins whose saddle is within this many pixels of the lower peak merge.
    const MERGE_DEPTH: f64 = 1.0;
    /// Distance values are compared at 1/1024 px resolution in the flood queue.
    const DISTANCE_SCALE: f64 = 1024.0;

    const NEIGHBORS: [(i64, i64); 8] = [(-1, -1), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1)];

    /// Integer label map; 0 is background, instances are `1..=count`.
    #[derive(Debug, Clone)]
    pub struct LabelMap {
        pub labels: Labels,
        pub count: u32,
    }

    impl LabelMap {
        fn empty(dims: FrameDims) -> Self {
            Self {
                labels: Labels::new(dims.width, dims.height),
                count: 0,
            }
        }

        pub fn dims(&self) -> FrameDims {
            FrameDims::of(&self.labels)
        }

        /// Pixel count per label, indexed by label (index 0 is background).
        pub fn areas(&self) -> Vec<usize> {
            let mut areas = vec![0usize; self.count as usize + 1];
            for &label in self.labels.as_raw() {
                if let Some(a) = areas.get_mut(label as usize) {
                    *a += 1;
                }
            }
            areas
        }
    }

    struct DistanceMap {
        width: u32,
        height: u32,
        values: Vec<f64>,
    }

    impl DistanceMap {
        fn of(mask: &Mask) -> Self {
            let (width, height) = mask.dimensions();
            let squared = euclidean_squared_distance_transform(&raster::invert(mask));
            // A mask with no background at all has no finite distances.
            let ceiling = (width as f64).hypot(height as f64);
            let values = squared
                .as_raw()
                .iter()
                .zip(mask.as_raw())
                .map(|(&d2, &m)| {
                    if m == 0 {
                        0.0
                    } else if d2.is_finite() {
                        d2.sqrt().min(ceiling)
                    } else {
                        ceiling
                    }
                })
                .collect();
            Self { width, height, values }
        }

        fn peak(&self) -> f64 {
            self.values.iter().copied().fold(0.0, f64::max)
        }

        /// Maximum over a (2r+1)² window, computed separably.
        fn window_max(&self, radius: u32) -> Vec<f64> {
            let (w, h, r) = (self.width as usize, self.height as usize, radius as usize);
            let mut rows = vec![0.0f64; w * h];
            for y in 0..h {
                let line = &self.values[y * w..(y + 1) * w];
                for x in 0..w {
                    let lo = x.saturating_sub(r);
                    let hi = (x + r).min(w - 1);
                    rows[y * w + x] = line[lo..=hi].iter().copied().fold(0.0, f64::max);
                }
            }
            let mut out = vec![0.0f64; w * h];
            for x in 0..w {
                for y in 0..h {
                    let lo = y.saturating_sub(r);
                    let hi = (y + r).min(h - 1);
                    out[y * w + x] = (lo..=hi).map(|yy| rows[yy * w + x]).fold(0.0, f64::max);
                }
            }
            out
        }
    }

    pub fn separate_instances(mask: &Mask, config: &DetectionConfig) -> LabelMap {
        let dims = FrameDims::of(mask);
        if raster::count(mask) == 0 {
            return LabelMap::empty(dims);
        }

        let tiers: &[SeparatorMode] = match config.separator {
            SeparatorMode::Watershed => &[SeparatorMode::Watershed, SeparatorMode::CoreThreshold],
            SeparatorMode::CoreThreshold => &[SeparatorMode::CoreThreshold],
            SeparatorMode::Components => &[],
        };

        if !tiers.is_empty() {
            let distance = DistanceMap::of(mask);
            for tier in tiers {
                let separated = match tier {
                    SeparatorMode::Watershed => watershed(mask, &distance, config.peak_min_distance),
                    SeparatorMode::CoreThreshold => core_threshold(mask, &distance, config.core_threshold),
                    SeparatorMode::Components => None,
                };
                if let Some(map) = separated {
                    debug!(tier = ?tier, instances = map.count, "instances separated");
                    return map;
                }
                trace!(tier = ?tier, "separator tier degenerated");
            }
        }

        let map = components(mask);
        debug!(instances = map.count, "instances from plain components");
        map
    }

    fn watershed(mask: &Mask, distance: &DistanceMap, min_distance: u32) -> Option<LabelMap> {
        let local_max = distance.window_max(min_distance.max(1));
        let seeds = raster::from_fn(FrameDims::of(mask), |x, y| {
            let i = (y * distance.width + x) as usize;
            let d = distance.values[i];
            d >= 1.0 && d >= local_max[i] - 0.5
        });
        flood_from(mask, distance, &seeds, true)
    }

    fn core_threshold(mask: &Mask, distance: &DistanceMap, fraction: f64) -> Option<LabelMap> {
        let cut = fraction * distance.peak();
        let cores = raster::from_fn(FrameDims::of(mask), |x, y| {
            distance.values[(y * distance.width + x) as usize] > cut
        });
        flood_from(mask, distance, &cores, false)
    }

    fn components(mask: &Mask) -> LabelMap {
        let labels = connected_components(mask, Connectivity::Eight, Luma([raster::OFF]));
        let count = labels.as_raw().iter().copied().max().unwrap_or(0);
        LabelMap { labels, count }
    }

    /// Flood every marker component downhill over the distance map, restricted
    /// to the foreground. `None` when there are no markers.
    fn flood_from(mask: &Mask, distance: &DistanceMap, markers: &Mask, merge_shallow: bool) -> Option<LabelMap> {
        let seeds = connected_components(markers, Connectivity::Eight, Luma([raster::OFF]));
        let marker_count = seeds.as_raw().iter().copied().max().unwrap_or(0);
        if marker_count == 0 {
            return None;
        }

        let (w, h) = (distance.width as i64, distance.height as i64);
        let fg = mask.as_raw();
        let d = &distance.values;
        let key = |i: usize| (d[i] * DISTANCE_SCALE) as u64;

        let mut labels: Vec<u32> = seeds.into_raw();
        let mut peaks = vec![0.0f64; marker_count as usize + 1];
        let mut heap = BinaryHeap::new();
        let mut seq = 0u64;
        for (i, &label) in labels.iter().enumerate() {
            if label != 0 {
                peaks[label as usize] = peaks[label as usize].max(d[i]);
                heap.push((key(i), Reverse(seq), i));
                seq += 1;
            }
        }

        let mut saddles: HashMap<(u32, u32), f64> = HashMap::new();
        while let Some((_, _, i)) = heap.pop() {
            let label = labels[i];
            let (x, y) = ((i as i64) % w, (i as i64) / w);
            for (dx, dy) in NEIGHBORS {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w || ny >= h {
                    continue;
                }
                let j = (ny * w + nx) as usize;
                if fg[j] == 0 {
                    continue;
                }
                match labels[j] {
                    0 => {
                        labels[j] = label;
                        heap.push((key(j), Reverse(seq), j));
                        seq += 1;
                    }
                    other if other != label => {
                        let pair = (label.min(other), label.max(other));
                        let saddle = d[i].min(d[j]);
                        let entry = saddles.entry(pair).or_insert(0.0);
                        *entry = entry.max(saddle);
                    }
                    _ => {}
                }
            }
        }

        let mut parent: Vec<u32> = (0..=marker_count).collect();
        if merge_shallow {
            for (&(a, b), &saddle) in &saddles {
                if saddle >= peaks[a as usize].min(peaks[b as usize]) - MERGE_DEPTH {
                    union(&mut parent, a, b);
                }
            }
        }

        // Foreground the flood never reached (no marker in its component).
        let mut next_orphan = marker_count;
        let orphans = raster::from_fn(FrameDims::new(distance.width, distance.height), |x, y| {
            let i = (y * distance.width + x) as usize;
            fg[i] > 0 && labels[i] == 0
        });
        if raster::count(&orphans) > 0 {
            let extra = connected_components(&orphans, Connectivity::Eight, Luma([raster::OFF]));
            for (slot, &e) in labels.iter_mut().zip(extra.as_raw()) {
                if e != 0 {
                    *slot = marker_count + e;
                    next_orphan = next_orphan.max(marker_count + e);
                }
            }
            parent.extend(marker_count + 1..=next_orphan);
        }

        // Compact to 1..=count in first-seen order.
        let mut remap: HashMap<u32, u32> = HashMap::new();
        for slot in labels.iter_mut() {
            if *slot == 0 {
                continue;
            }
            let root = find(&mut parent, *slot);
            let next = remap.len() as u32 + 1;
            *slot = *remap.entry(root).or_insert(next);
        }
        let count = remap.len() as u32;
        let labels = Labels::from_raw(distance.width, distance.height, labels)?;
        Some(LabelMap { labels, count })
    }

    fn find(parent: &mut [u32], mut x: u32) -> u32 {
        while parent[x as usize] != x {
            let grand = parent[parent[x as usize] as usize];
            parent[x as usize] = grand;
            x = grand;
        }
        x
    }

    fn union(parent: &mut [u32], a: u32, b: u32) {
        let (ra, rb) = (find(parent, a), find(parent, b));
        if ra != rb {
            parent[ra.max(rb) as usize] = ra.min(rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::instance_separator::*;
    use crate::config::{DetectionConfig, SeparatorMode};
    use crate::core_modules::contour::FrameDims;
    use crate::core_modules::raster::{self, Mask};

    fn disc(cx: f64, cy: f64, r: f64) -> impl Fn(u32, u32) -> bool {
        move |x, y| {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            dx * dx + dy * dy <= r * r
        }
    }

    fn dumbbell() -> Mask {
        let dims = FrameDims::new(100, 60);
        let left = disc(30.0, 30.0, 15.0);
        let right = disc(64.0, 30.0, 15.0);
        raster::from_fn(dims, |x, y| left(x, y) || right(x, y) || ((44..=50).contains(&x) && (28..=31).contains(&y)))
    }

    #[test]
    fn single_convex_blob_is_one_instance() {
        let dims = FrameDims::new(120, 120);
        let mask = raster::from_fn(dims, disc(60.0, 60.0, 25.0));
        let map = separate_instances(&mask, &DetectionConfig::default());
        assert_eq!(map.count, 1);
        assert_eq!(map.areas()[1], raster::count(&mask));
    }

    #[test]
    fn square_is_one_instance() {
        let dims = FrameDims::new(200, 200);
        let mask = raster::from_fn(dims, |x, y| (50..150).contains(&x) && (50..150).contains(&y));
        let map = separate_instances(&mask, &DetectionConfig::default());
        assert_eq!(map.count, 1);
        assert_eq!(map.areas()[1], 10_000);
    }

    #[test]
    fn watershed_splits_touching_discs() {
        let mask = dumbbell();
        let map = separate_instances(&mask, &DetectionConfig::default());
        assert_eq!(map.count, 2);
        let areas = map.areas();
        assert_eq!(areas[1] + areas[2], raster::count(&mask));
        assert_ne!(map.labels.get_pixel(30, 30)[0], map.labels.get_pixel(64, 30)[0]);
    }

    #[test]
    fn core_threshold_tier_also_splits() {
        let config = DetectionConfig {
            separator: SeparatorMode::CoreThreshold,
            ..DetectionConfig::default()
        };
        let map = separate_instances(&dumbbell(), &config);
        assert_eq!(map.count, 2);
    }

    #[test]
    fn components_tier_keeps_dumbbell_whole() {
        let config = DetectionConfig {
            separator: SeparatorMode::Components,
            ..DetectionConfig::default()
        };
        let map = separate_instances(&dumbbell(), &config);
        assert_eq!(map.count, 1);
    }

    #[test]
    fn empty_mask_has_no_instances() {
        let mask = raster::empty(FrameDims::new(10, 10));
        assert_eq!(separate_instances(&mask, &DetectionConfig::default()).count, 0);
    }
}
