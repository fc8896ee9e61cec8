// THEORY:
// Every tuning constant of the overlay engine lives here instead of being
// scattered as magic numbers through the pixel code. Two groups exist:
// `DetectionConfig` for the fast built-in detection path (field of view,
// candidate cues, instance separation, contour filtering) and `EngineConfig`
// for everything around it (selection, caching, rendering, timeouts).
//
// Area thresholds are expressed as fractions of the frame area so the same
// configuration behaves identically at any stream resolution.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the instance separator splits touching foreground blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeparatorMode {
    /// Distance-transform peaks seed a marker-based watershed.
    Watershed,
    /// Connected components of the distance map thresholded at `core_threshold` of its peak.
    CoreThreshold,
    /// Plain connected components of the foreground.
    Components,
}

/// Constants for the fast built-in detection path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Grayscale percentile used to binarize the optical viewport.
    pub fov_percentile: f64,
    /// Lower bound for the viewport threshold.
    pub fov_min_threshold: u8,
    /// Radius of the closing applied to the viewport candidate.
    pub fov_close_radius: u8,
    /// Safety margin eroded from the viewport, as a fraction of the shorter side.
    pub fov_margin_fraction: f64,
    /// Minimum share of the frame a component must cover to count as a viewport.
    pub fov_min_coverage: f64,
    /// Number of agreeing cues that marks a pixel as foreground.
    pub min_votes: usize,
    /// Block radius of the adaptive threshold cue.
    pub adaptive_radius: u32,
    /// Offset below/above the local mean for the adaptive threshold cue.
    pub adaptive_offset: i16,
    /// Width of the band inside the viewport edge used for rim rejection of components.
    pub rim_band_radius: u8,
    /// Maximum share of a component (or instance) allowed inside the rim band.
    pub rim_overlap_max: f64,
    /// Width of the rim band used when filtering individual instances.
    pub contour_rim_radius: u8,
    /// Instances smaller than this share of the frame are dropped.
    pub min_area_fraction: f64,
    /// Absolute floor for the minimum instance area, in pixels.
    pub min_area_px: f64,
    /// Instances larger than this share of the frame are dropped.
    pub max_area_fraction: f64,
    pub min_circularity: f64,
    pub min_solidity: f64,
    /// Grid size used to merge near-duplicate centroids.
    pub dedup_grid: i32,
    /// Polygon simplification tolerance as a fraction of the perimeter.
    pub simplify_tolerance: f64,
    /// Minimum separation between watershed seeds, in pixels.
    pub peak_min_distance: u32,
    /// Fraction of the peak distance used by the core-threshold fallback.
    pub core_threshold: f64,
    pub separator: SeparatorMode,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            fov_percentile: 15.0,
            fov_min_threshold: 8,
            fov_close_radius: 6,
            fov_margin_fraction: 0.02,
            fov_min_coverage: 0.2,
            min_votes: 3,
            adaptive_radius: 15,
            adaptive_offset: 4,
            rim_band_radius: 8,
            rim_overlap_max: 0.08,
            contour_rim_radius: 6,
            min_area_fraction: 0.000012,
            min_area_px: 12.0,
            max_area_fraction: 0.03,
            min_circularity: 0.20,
            min_solidity: 0.55,
            dedup_grid: 4,
            simplify_tolerance: 0.007,
            peak_min_distance: 7,
            core_threshold: 0.45,
            separator: SeparatorMode::Watershed,
        }
    }
}

/// Configuration for the segmentation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// JPEG quality of re-encoded output frames.
    pub jpeg_quality: u8,
    /// Maximum number of live proposals.
    pub proposal_limit: usize,
    /// Maximum number of candidates described in a propose report.
    pub preview_limit: usize,
    /// Hard cap on the contours of one selection.
    pub selection_cap: usize,
    /// Proposals scoring at least this share of the top score join an implicit selection.
    pub confidence_band: f64,
    /// Number of processed frames between drift recalibration passes. Zero disables it.
    pub recalibration_interval: u64,
    /// Weight of the overlay fill when blended into the frame.
    pub fill_alpha: f32,
    /// Outline thickness as a fraction of the shorter frame side.
    pub outline_fraction: f64,
    /// Time budget of the fast built-in backend.
    pub fast_timeout_ms: u64,
    /// Time budget of externally supplied heavy backends.
    pub heavy_timeout_ms: u64,
    /// Number of top proposals picked by `segment`.
    pub auto_select_top_k: usize,
    /// Worker threads for pixel work. Zero means one per CPU.
    pub worker_threads: usize,
    pub detection: DetectionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 75,
            proposal_limit: 400,
            preview_limit: 60,
            selection_cap: 220,
            confidence_band: 0.72,
            recalibration_interval: 60,
            fill_alpha: 0.45,
            outline_fraction: 0.003,
            fast_timeout_ms: 2_000,
            heavy_timeout_ms: 10_000,
            auto_select_top_k: 25,
            worker_threads: 0,
            detection: DetectionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: &str| Err(EngineError::Config(msg.to_string()));

        if !(1..=100).contains(&self.jpeg_quality) {
            return fail("jpeg_quality must be between 1 and 100");
        }
        if self.proposal_limit == 0 || self.selection_cap == 0 {
            return fail("proposal_limit and selection_cap must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.confidence_band) {
            return fail("confidence_band must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.fill_alpha) {
            return fail("fill_alpha must be within [0, 1]");
        }
        if self.outline_fraction < 0.0 || self.outline_fraction > 0.1 {
            return fail("outline_fraction must be within [0, 0.1]");
        }
        if self.fast_timeout_ms == 0 || self.heavy_timeout_ms == 0 {
            return fail("backend timeouts must be non-zero");
        }

        let d = &self.detection;
        if !(0.0..=100.0).contains(&d.fov_percentile) {
            return fail("detection.fov_percentile must be within [0, 100]");
        }
        if d.min_votes == 0 {
            return fail("detection.min_votes must be at least 1");
        }
        if d.min_area_fraction < 0.0 || d.max_area_fraction <= d.min_area_fraction {
            return fail("detection area fractions must satisfy 0 <= min < max");
        }
        if d.dedup_grid <= 0 {
            return fail("detection.dedup_grid must be positive");
        }
        if !(0.0..=1.0).contains(&d.core_threshold) {
            return fail("detection.core_threshold must be within [0, 1]");
        }
        Ok(())
    }

    pub fn fast_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_timeout_ms)
    }

    pub fn heavy_timeout(&self) -> Duration {
        Duration::from_millis(self.heavy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.proposal_limit, 400);
        assert_eq!(config.selection_cap, 220);
        assert_eq!(config.recalibration_interval, 60);
        assert!((config.confidence_band - 0.72).abs() < 1e-12);
        assert_eq!(config.detection.separator, SeparatorMode::Watershed);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(
            r#"{ "confidence_band": 0.5, "detection": { "separator": "components" } }"#,
        )
        .unwrap();
        assert!((config.confidence_band - 0.5).abs() < 1e-12);
        assert_eq!(config.detection.separator, SeparatorMode::Components);
        assert_eq!(config.jpeg_quality, 75);
        assert_eq!(config.detection.peak_min_distance, 7);
    }

    #[test]
    fn rejects_out_of_range_band() {
        let config = EngineConfig {
            confidence_band: 1.5,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn rejects_garbage_json() {
        assert!(EngineConfig::from_json("{ not json").is_err());
    }
}
