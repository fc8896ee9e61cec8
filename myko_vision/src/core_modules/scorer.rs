// THEORY:
// The scorer ranks instances by how well they match the caller's query. It is
// purely additive and deterministic: the same features and query always give
// the same score. All size terms use the instance's area relative to the
// frame, so rankings do not change with stream resolution.

use crate::core_modules::contour::ContourFeatures;
use crate::core_modules::query::QueryIntent;

/// Relative area at which the base size term saturates.
const SIZE_SATURATION: f64 = 0.0003;
const RBC_CIRCULARITY_WEIGHT: f64 = 1.3;
const RBC_SWEET_SPOT: (f64, f64) = (0.003, 0.025);
const RBC_SWEET_SPOT_BONUS: f64 = 0.8;
const RBC_SPECK_AREA: f64 = 0.00005;
const RBC_SPECK_PENALTY: f64 = 0.5;
const RBC_ROUND_ASPECT: f64 = 1.5;
const RBC_ROUND_BONUS: f64 = 0.5;
const GENERIC_BONUS: f64 = 0.3;
const LARGE_SCALE: f64 = 0.0015;
const LARGE_CAP: f64 = 1.2;
const SMALL_AREA: f64 = 0.0003;
const SMALL_BONUS: f64 = 0.9;
const SMALL_PENALTY: f64 = 0.3;

pub fn score(features: &ContourFeatures, intent: &QueryIntent, frame_area: f64) -> f64 {
    let rel = if frame_area > 0.0 {
        features.area / frame_area
    } else {
        0.0
    };

    let mut score = (rel / SIZE_SATURATION).min(1.0) + features.circularity;

    if intent.specific_rbc {
        score += RBC_CIRCULARITY_WEIGHT * features.circularity;
        if (RBC_SWEET_SPOT.0..=RBC_SWEET_SPOT.1).contains(&rel) {
            score += RBC_SWEET_SPOT_BONUS;
        }
        if rel < RBC_SPECK_AREA {
            score -= RBC_SPECK_PENALTY;
        }
        if features.bbox.aspect_ratio() <= RBC_ROUND_ASPECT {
            score += RBC_ROUND_BONUS;
        }
    } else if intent.generic {
        score += GENERIC_BONUS;
    }

    if intent.large {
        score += (rel / LARGE_SCALE).min(LARGE_CAP);
    }
    if intent.small {
        score += if rel < SMALL_AREA {
            SMALL_BONUS
        } else {
            -SMALL_PENALTY
        };
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::contour::BoundingBox;

    fn features(area: f64, circularity: f64, w: i32, h: i32) -> ContourFeatures {
        ContourFeatures {
            area,
            perimeter: 1.0,
            circularity,
            solidity: 1.0,
            center: (0, 0),
            bbox: BoundingBox {
                x: 0,
                y: 0,
                width: w,
                height: h,
            },
        }
    }

    #[test]
    fn base_score_saturates() {
        let intent = QueryIntent::parse("things");
        let big = score(&features(1_000.0, 0.5, 30, 30), &intent, 1_000_000.0);
        let bigger = score(&features(5_000.0, 0.5, 70, 70), &intent, 1_000_000.0);
        assert!((big - 1.5).abs() < 1e-9);
        assert!((bigger - big).abs() < 1e-9);
    }

    #[test]
    fn rbc_query_rewards_round_cells_in_the_sweet_spot() {
        let intent = QueryIntent::parse("red blood cells");
        let cell = features(10_000.0, 0.9, 110, 110);
        let s = score(&cell, &intent, 1_000_000.0);
        // 1 + 0.9 + 1.3*0.9 + 0.8 + 0.5
        assert!((s - 4.37).abs() < 1e-9);

        let speck = features(20.0, 0.9, 5, 5);
        assert!(score(&speck, &intent, 1_000_000.0) < s - 2.0);

        let elongated = features(10_000.0, 0.9, 200, 50);
        assert!((s - score(&elongated, &intent, 1_000_000.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn size_keywords() {
        let frame = 1_000_000.0;
        let large = QueryIntent::parse("large things");
        let small = QueryIntent::parse("small things");
        let plain = QueryIntent::parse("things");
        let a = features(3_000.0, 0.8, 60, 60);
        let b = features(100.0, 0.8, 10, 10);
        assert!(score(&a, &large, frame) - score(&a, &plain, frame) > 1.0);
        assert!(score(&b, &small, frame) > score(&b, &plain, frame));
        assert!(score(&a, &small, frame) < score(&a, &plain, frame));
    }

    #[test]
    fn deterministic() {
        let intent = QueryIntent::parse("all cells");
        let f = features(420.0, 0.71, 22, 24);
        assert_eq!(score(&f, &intent, 640.0 * 480.0), score(&f, &intent, 640.0 * 480.0));
    }
}
