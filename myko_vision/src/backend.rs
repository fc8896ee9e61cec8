// THEORY:
// Everything after instance finding (scoring, selection, caching, rendering)
// is backend-agnostic. A backend only has to turn a frame and a query into
// pixel-space contours, which is the whole `InstanceFinder` contract.
//
// The built-in `FastBackend` chains the classical stages: field of view,
// candidate voting, instance separation, contour filtering. Heavy model
// backends are supplied from outside and registered in one of two slots.
// `BackendChoice::Auto` prefers a registered heavy backend and otherwise uses
// the fast one; an explicitly requested but unregistered heavy backend also
// degrades to the fast one.

use crate::config::DetectionConfig;
use crate::core_modules::candidate_builder::candidate_builder::{Foreground, build_foreground};
use crate::core_modules::contour::Contour;
use crate::core_modules::contour_filter::contour_filter::extract_contours;
use crate::core_modules::fov_detector::fov_detector::detect_field_of_view;
use crate::core_modules::instance_separator::instance_separator::{LabelMap, separate_instances};
use crate::core_modules::query::QueryIntent;
use crate::core_modules::raster::Mask;
use crate::error::BackendError;
use image::RgbImage;
use image::imageops::grayscale;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// The single capability every instance-finding strategy provides.
pub trait InstanceFinder: Send + Sync {
    fn name(&self) -> &str;

    fn find_instances(&self, frame: &RgbImage, query: &str) -> Result<Vec<Contour>, BackendError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    #[default]
    Auto,
    Fast,
    Heavy1,
    Heavy2,
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendChoice::Auto => "auto",
            BackendChoice::Fast => "fast",
            BackendChoice::Heavy1 => "heavy1",
            BackendChoice::Heavy2 => "heavy2",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendChoice {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(BackendChoice::Auto),
            "fast" => Ok(BackendChoice::Fast),
            "heavy1" => Ok(BackendChoice::Heavy1),
            "heavy2" => Ok(BackendChoice::Heavy2),
            other => Err(BackendError::Unavailable(other.to_string())),
        }
    }
}

/// All intermediates of one fast detection pass.
#[derive(Debug, Clone)]
pub struct Detection {
    pub fov: Mask,
    pub foreground: Foreground,
    pub labels: LabelMap,
    pub contours: Vec<Contour>,
}

/// The built-in classical pipeline.
#[derive(Debug, Clone, Default)]
pub struct FastBackend {
    config: DetectionConfig,
}

impl FastBackend {
    pub const NAME: &'static str = "fast";

    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, frame: &RgbImage, intent: &QueryIntent) -> Detection {
        let gray = grayscale(frame);
        let fov = detect_field_of_view(&gray, &self.config);
        let foreground = build_foreground(frame, &fov, intent.region, &self.config);
        let labels = separate_instances(&foreground.mask, &self.config);
        let contours = extract_contours(&labels, &fov, &self.config);
        debug!(
            cues = foreground.cues.len(),
            instances = labels.count,
            contours = contours.len(),
            "fast detection pass"
        );
        Detection {
            fov,
            foreground,
            labels,
            contours,
        }
    }
}

impl InstanceFinder for FastBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn find_instances(&self, frame: &RgbImage, query: &str) -> Result<Vec<Contour>, BackendError> {
        Ok(self.detect(frame, &QueryIntent::parse(query)).contours)
    }
}

/// A backend picked for one call, and whether it runs on the heavy budget.
#[derive(Clone)]
pub struct ResolvedBackend {
    pub finder: Arc<dyn InstanceFinder>,
    pub heavy: bool,
}

pub struct BackendRegistry {
    fast: Arc<FastBackend>,
    heavy1: Option<Arc<dyn InstanceFinder>>,
    heavy2: Option<Arc<dyn InstanceFinder>>,
}

impl BackendRegistry {
    pub fn new(detection: DetectionConfig) -> Self {
        Self {
            fast: Arc::new(FastBackend::new(detection)),
            heavy1: None,
            heavy2: None,
        }
    }

    /// Installs an external backend into a heavy slot.
    pub fn register(&mut self, slot: BackendChoice, backend: Arc<dyn InstanceFinder>) -> Result<(), BackendError> {
        match slot {
            BackendChoice::Heavy1 => self.heavy1 = Some(backend),
            BackendChoice::Heavy2 => self.heavy2 = Some(backend),
            other => return Err(BackendError::Unavailable(format!("{other} is not a heavy slot"))),
        }
        Ok(())
    }

    pub fn fast(&self) -> Arc<FastBackend> {
        Arc::clone(&self.fast)
    }

    pub fn resolve(&self, choice: BackendChoice) -> ResolvedBackend {
        let heavy = |backend: &Arc<dyn InstanceFinder>| ResolvedBackend {
            finder: Arc::clone(backend),
            heavy: true,
        };
        let fast = ResolvedBackend {
            finder: self.fast.clone(),
            heavy: false,
        };

        match choice {
            BackendChoice::Fast => fast,
            BackendChoice::Auto => self.heavy1.as_ref().or(self.heavy2.as_ref()).map(heavy).unwrap_or(fast),
            BackendChoice::Heavy1 | BackendChoice::Heavy2 => {
                let slot = if choice == BackendChoice::Heavy1 {
                    &self.heavy1
                } else {
                    &self.heavy2
                };
                match slot {
                    Some(backend) => heavy(backend),
                    None => {
                        warn!(backend = %choice, "requested backend is not registered; using fast");
                        fast
                    }
                }
            }
        }
    }
}
