// THEORY:
// A `Proposal` is one scored, not-yet-selected instance. Proposals are built
// from whatever contours a backend returns: contours are sanitized first
// (heavy backends are not trusted to filter degenerate geometry), measured,
// scored against the query, stably sorted by descending score, and capped.
//
// A `ProposalSet` is immutable once built. The session swaps whole sets
// behind an `Arc`, so the selection path and the reporting path can read a
// consistent set without holding the session lock.

use crate::core_modules::contour::{Contour, ContourFeatures, FrameDims};
use crate::core_modules::query::QueryIntent;
use crate::core_modules::scorer;
use serde::Serialize;

const MIN_POINTS: usize = 3;
const MIN_POLYGON_AREA: f64 = 8.0;
const MIN_BOX_SIDE: i32 = 1;
const MAX_ASPECT_RATIO: f64 = 16.0;

#[derive(Debug, Clone)]
pub struct Proposal {
    pub contour: Contour,
    pub features: ContourFeatures,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct ProposalSet {
    pub proposals: Vec<Proposal>,
    pub dims: FrameDims,
    pub query: String,
    pub backend: String,
}

impl ProposalSet {
    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    pub fn scores(&self) -> Vec<f64> {
        self.proposals.iter().map(|p| p.score).collect()
    }

    pub fn report(&self, preview_limit: usize) -> ProposalReport {
        ProposalReport {
            count: self.proposals.len(),
            backend_used: self.backend.clone(),
            candidates: self
                .proposals
                .iter()
                .take(preview_limit)
                .enumerate()
                .map(|(index, p)| CandidateSummary::of(index, p))
                .collect(),
        }
    }
}

/// Features of one candidate as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSummary {
    pub index: usize,
    pub area: f64,
    pub circularity: f64,
    pub center: [i32; 2],
    pub bbox: [i32; 4],
    pub score: f64,
}

impl CandidateSummary {
    fn of(index: usize, p: &Proposal) -> Self {
        let f = &p.features;
        Self {
            index,
            area: round_to(f.area, 2),
            circularity: round_to(f.circularity, 3),
            center: [f.center.0, f.center.1],
            bbox: [f.bbox.x, f.bbox.y, f.bbox.width, f.bbox.height],
            score: round_to(p.score, 3),
        }
    }
}

/// Result of `propose`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalReport {
    pub count: usize,
    pub backend_used: String,
    pub candidates: Vec<CandidateSummary>,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Drops contours with too few points, negligible area, a collapsed bounding
/// box, or an extreme aspect ratio.
pub fn is_sane(contour: &Contour) -> bool {
    if contour.len() < MIN_POINTS || contour.area() <= MIN_POLYGON_AREA {
        return false;
    }
    match contour.bounding_box() {
        Some(bbox) => {
            bbox.width > MIN_BOX_SIDE && bbox.height > MIN_BOX_SIDE && bbox.aspect_ratio() <= MAX_ASPECT_RATIO
        }
        None => false,
    }
}

pub fn build_proposals(contours: Vec<Contour>, intent: &QueryIntent, dims: FrameDims, limit: usize) -> Vec<Proposal> {
    let frame_area = dims.area();
    let mut proposals: Vec<Proposal> = contours
        .into_iter()
        .filter(is_sane)
        .filter_map(|contour| {
            let features = contour.features()?;
            let score = scorer::score(&features, intent, frame_area);
            score.is_finite().then_some(Proposal {
                contour,
                features,
                score,
            })
        })
        .collect();

    // `sort_by` is stable, so equal scores keep discovery order.
    proposals.sort_by(|a, b| b.score.total_cmp(&a.score));
    proposals.truncate(limit);
    proposals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: i32, y0: i32, side: i32) -> Contour {
        let (x1, y1) = (x0 + side - 1, y0 + side - 1);
        Contour::from_xy(&[(x0, y0), (x1, y0), (x1, y1), (x0, y1)])
    }

    #[test]
    fn sanitizer_rejects_degenerate_geometry() {
        assert!(!is_sane(&Contour::from_xy(&[(0, 0), (5, 0)])));
        assert!(!is_sane(&square(0, 0, 3)));
        assert!(!is_sane(&Contour::from_xy(&[(0, 0), (100, 0), (100, 3), (0, 3)])));
        assert!(is_sane(&square(10, 10, 20)));
    }

    #[test]
    fn proposals_sorted_stable_and_capped() {
        let intent = QueryIntent::parse("all cells");
        let dims = FrameDims::new(1000, 1000);
        let contours = vec![square(0, 0, 10), square(100, 100, 40), square(300, 300, 10), square(500, 500, 40)];
        let proposals = build_proposals(contours, &intent, dims, 3);
        assert_eq!(proposals.len(), 3);
        assert!(proposals[0].score >= proposals[1].score);
        assert!(proposals[1].score >= proposals[2].score);
        // Equal scores keep discovery order.
        assert_eq!(proposals[0].features.bbox.x, 100);
        assert_eq!(proposals[1].features.bbox.x, 500);
        assert_eq!(proposals[2].features.bbox.x, 0);
    }

    #[test]
    fn report_rounds_and_previews() {
        let dims = FrameDims::new(1000, 1000);
        let proposals = build_proposals(vec![square(50, 50, 100)], &QueryIntent::default(), dims, 400);
        let set = ProposalSet {
            proposals,
            dims,
            query: "cells".into(),
            backend: "fast".into(),
        };
        let report = set.report(60);
        assert_eq!(report.count, 1);
        assert_eq!(report.backend_used, "fast");
        let c = &report.candidates[0];
        assert_eq!(c.index, 0);
        assert_eq!(c.area, 9801.0);
        assert_eq!(c.bbox, [50, 50, 100, 100]);
        assert_eq!(c.circularity, 0.785);
        assert_eq!(set.report(0).candidates.len(), 0);
    }
}
