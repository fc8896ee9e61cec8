// THEORY:
// Queries arrive as free text from the conversational layer ("select all the
// red blood cells in the top left"). The engine never interprets them beyond a
// handful of keywords, and it does that exactly once: `QueryIntent::parse`
// turns the string into flags that the scorer, the selection policy and the
// candidate builder read. Matching is on whole lowercase words, so "cellular"
// never triggers "cell".

use serde::Serialize;

/// Spatial restriction derived from "top"/"bottom"/"left"/"right".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegionOfInterest {
    pub top: bool,
    pub bottom: bool,
    pub left: bool,
    pub right: bool,
}

impl RegionOfInterest {
    /// True when the region is the full field of view.
    pub fn is_full(&self) -> bool {
        self.vertical().is_none() && self.horizontal().is_none()
    }

    /// `Some(true)` for the top half, `Some(false)` for the bottom half.
    pub fn vertical(&self) -> Option<bool> {
        match (self.top, self.bottom) {
            (true, false) => Some(true),
            (false, true) => Some(false),
            _ => None,
        }
    }

    /// `Some(true)` for the left half, `Some(false)` for the right half.
    pub fn horizontal(&self) -> Option<bool> {
        match (self.left, self.right) {
            (true, false) => Some(true),
            (false, true) => Some(false),
            _ => None,
        }
    }

    pub fn contains(&self, x: u32, y: u32, width: u32, height: u32) -> bool {
        let vertical_ok = match self.vertical() {
            Some(true) => y < height / 2,
            Some(false) => y >= height / 2,
            None => true,
        };
        let horizontal_ok = match self.horizontal() {
            Some(true) => x < width / 2,
            Some(false) => x >= width / 2,
            None => true,
        };
        vertical_ok && horizontal_ok
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryIntent {
    /// "red blood cell(s)", "rbc", "rbcs".
    pub specific_rbc: bool,
    /// "all", "every", "cell", "cells".
    pub generic: bool,
    /// "all", "every", "everything".
    pub wants_all: bool,
    /// "single", "one", "top", "best", "largest", "smallest".
    pub wants_single: bool,
    pub large: bool,
    pub small: bool,
    pub region: RegionOfInterest,
}

impl QueryIntent {
    pub fn parse(query: &str) -> Self {
        let lowered = query.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has = |w: &str| words.contains(&w);
        let has_any = |ws: &[&str]| ws.iter().any(|w| has(w));

        let red_blood = words
            .windows(2)
            .any(|pair| pair[0] == "red" && pair[1] == "blood");

        Self {
            specific_rbc: red_blood || has_any(&["rbc", "rbcs", "erythrocyte", "erythrocytes"]),
            generic: has_any(&["all", "every", "cell", "cells"]),
            wants_all: has_any(&["all", "every", "everything"]),
            wants_single: has_any(&["single", "one", "top", "best", "largest", "smallest"]),
            large: words
                .iter()
                .any(|w| w.starts_with("large") || *w == "big" || *w == "bigger" || *w == "biggest"),
            small: words
                .iter()
                .any(|w| w.starts_with("small") || *w == "tiny" || *w == "little"),
            region: RegionOfInterest {
                top: has_any(&["top", "upper"]),
                bottom: has_any(&["bottom", "lower"]),
                left: has("left"),
                right: has("right"),
            },
        }
    }
}
