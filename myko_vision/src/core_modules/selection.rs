// THEORY:
// The selection policy converts what the caller asked for (a few indices and a
// query) into the concrete proposals that become one active mask set. The
// upstream chooser often names only a handful of indices even when it wants
// every cell of that kind, so unless the query asks for a single item the
// selection is widened to the confidence band: every proposal scoring at least
// `band` of the top score.
//
// Rules, in order:
// 1. Out-of-range and duplicate indices are dropped. Nothing left and no
//    "all" intent: fail.
// 2. "all"/"every" with more proposals than requested: every proposal.
// 3. Otherwise, unless single-intent: add the confidence band, which always
//    contains the top proposal.
// 4. Order by rank and cap.

use crate::core_modules::query::QueryIntent;
use crate::error::EngineError;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    pub band: f64,
    pub cap: usize,
}

impl SelectionPolicy {
    pub fn new(band: f64, cap: usize) -> Self {
        Self { band, cap }
    }

    /// Resolves requested indices against the scores of the live proposal
    /// set (in rank order). Returns ascending proposal indices.
    pub fn resolve(&self, requested: &[i64], intent: &QueryIntent, scores: &[f64]) -> Result<Vec<usize>, EngineError> {
        let count = scores.len();
        let no_valid = || EngineError::NoValidIndices { proposal_count: count };
        if count == 0 {
            return Err(no_valid());
        }

        let mut chosen: BTreeSet<usize> = requested
            .iter()
            .filter_map(|&i| usize::try_from(i).ok())
            .filter(|&i| i < count)
            .collect();
        if chosen.is_empty() && !intent.wants_all {
            return Err(no_valid());
        }

        if intent.wants_all && count > chosen.len() {
            chosen = (0..count).collect();
        } else if !intent.wants_single {
            chosen.extend(confidence_band(scores, self.band));
        }

        Ok(chosen.into_iter().take(self.cap).collect())
    }
}

/// Indices scoring at least `band` of the top score. Always contains the
/// top-scoring index when `scores` is non-empty.
pub fn confidence_band(scores: &[f64], band: f64) -> Vec<usize> {
    let Some((top_index, top)) = scores
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
    else {
        return Vec::new();
    };
    // A non-positive peak has no meaningful fraction; only ties with it count.
    let threshold = if top > 0.0 { band * top } else { top };
    let mut out: Vec<usize> = scores
        .iter()
        .enumerate()
        .filter(|&(_, &s)| s >= threshold)
        .map(|(i, _)| i)
        .collect();
    if !out.contains(&top_index) {
        out.push(top_index);
        out.sort_unstable();
    }
    out
}
