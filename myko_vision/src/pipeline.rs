// THEORY:
// The `pipeline` module is the top-level API of the overlay engine. A
// `Session` is the one segmentation session of a process: it owns the live
// proposal set, the active mask sets, the most recent raw frame, the backend
// registry and the CPU pool. It is constructed explicitly and shared as
// `Arc<Session>`; there are no module-level globals.
//
// Three call paths touch the shared state:
// - `propose`/`select`/`clear`/`segment`, driven by the external caller,
// - `render_frame`, driven by the frame processing loop,
// - `recalibrate`, fired by the scheduler from the processing loop.
// All of them serialize on one `parking_lot::Mutex<SessionState>`, and every
// critical section is a pointer or struct swap. Pixel work happens on
// snapshots (`Arc` clones) outside the lock.
//
// Rendering is fail-open: `render_frame` has no error path. With no active
// sets it returns its input unchanged without decoding; any decode, render or
// encode failure also returns the input unchanged.

use crate::backend::{BackendChoice, BackendRegistry, FastBackend, InstanceFinder, ResolvedBackend};
use crate::config::EngineConfig;
use crate::core_modules::codec::codec;
use crate::core_modules::compositor::{OverlayStyle, composite};
use crate::core_modules::contour::{Contour, FrameDims};
use crate::core_modules::mask_cache::{ActiveMaskSet, palette_color};
use crate::core_modules::proposal::{ProposalReport, ProposalSet, build_proposals};
use crate::core_modules::query::QueryIntent;
use crate::core_modules::recalibration::RecalibrationScheduler;
use crate::core_modules::selection::{SelectionPolicy, confidence_band};
use crate::error::{BackendError, EngineError, Result};
use crate::parallel_pipeline::CpuPool;
use image::RgbImage;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Query recorded for a selection made without one.
pub const DEFAULT_SELECTION_QUERY: &str = "selected masks";
/// Indices echoed back in a selection summary.
const SUMMARY_INDEX_LIMIT: usize = 20;

/// Outcome of a successful `select`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionSummary {
    pub set_id: u64,
    pub applied: usize,
    pub indices: Vec<usize>,
    pub query: String,
}

impl fmt::Display for SelectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: Vec<String> = self
            .indices
            .iter()
            .take(SUMMARY_INDEX_LIMIT)
            .map(|i| i.to_string())
            .collect();
        let more = if self.indices.len() > SUMMARY_INDEX_LIMIT { ", ..." } else { "" };
        write!(
            f,
            "Applied {} mask(s) from indices [{}{}] for '{}'.",
            self.applied,
            shown.join(", "),
            more,
            self.query
        )
    }
}

/// Outcome of one recalibration pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecalibrationOutcome {
    /// Sets whose contours were replaced.
    pub updated: usize,
    /// Sets left untouched because the rerun found nothing.
    pub kept: usize,
}

#[derive(Default)]
struct SessionState {
    proposals: Option<Arc<ProposalSet>>,
    active: Vec<Arc<ActiveMaskSet>>,
    color_cursor: usize,
    latest_frame: Option<Arc<str>>,
}

pub struct Session {
    config: EngineConfig,
    backends: BackendRegistry,
    pool: CpuPool,
    scheduler: RecalibrationScheduler,
    state: Mutex<SessionState>,
    next_set_id: AtomicU64,
}

impl Session {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = CpuPool::new(config.worker_threads);
        info!(workers = pool.size(), "segmentation session created");
        Ok(Self {
            backends: BackendRegistry::new(config.detection.clone()),
            scheduler: RecalibrationScheduler::new(config.recalibration_interval),
            pool,
            config,
            state: Mutex::new(SessionState::default()),
            next_set_id: AtomicU64::new(1),
        })
    }

    /// Registers an external backend in a heavy slot.
    pub fn with_heavy_backend(mut self, slot: BackendChoice, backend: Arc<dyn InstanceFinder>) -> Result<Self> {
        self.backends.register(slot, backend)?;
        Ok(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &CpuPool {
        &self.pool
    }

    pub fn proposal_count(&self) -> usize {
        self.state.lock().proposals.as_ref().map_or(0, |p| p.len())
    }

    /// Consistent snapshot of the active sets.
    pub fn active_sets(&self) -> Vec<Arc<ActiveMaskSet>> {
        self.state.lock().active.clone()
    }

    pub fn has_active_masks(&self) -> bool {
        !self.state.lock().active.is_empty()
    }

    /// Total contours across all active sets.
    pub fn active_mask_count(&self) -> usize {
        self.state.lock().active.iter().map(|s| s.len()).sum()
    }

    pub fn latest_frame(&self) -> Option<Arc<str>> {
        self.state.lock().latest_frame.clone()
    }

    /// Generates a fresh proposal set, superseding the previous one.
    pub async fn propose(&self, query: &str, frame: Option<&str>, choice: BackendChoice) -> Result<ProposalReport> {
        let image = self.acquire_frame(frame).await?;
        let resolved = self.backends.resolve(choice);

        let (contours, backend_used) = match self.run_backend(&resolved, &image, query).await {
            Ok(contours) => (contours, resolved.finder.name().to_string()),
            Err(err) if resolved.heavy => {
                warn!(%err, "heavy backend failed; falling back to fast");
                let fast = ResolvedBackend {
                    finder: self.backends.fast(),
                    heavy: false,
                };
                (self.run_backend(&fast, &image, query).await?, FastBackend::NAME.to_string())
            }
            Err(err) => return Err(err.into()),
        };

        let intent = QueryIntent::parse(query);
        let dims = FrameDims::of(&*image);
        let proposals = build_proposals(contours, &intent, dims, self.config.proposal_limit);
        let set = Arc::new(ProposalSet {
            proposals,
            dims,
            query: query.to_string(),
            backend: backend_used,
        });
        let report = set.report(self.config.preview_limit);
        self.state.lock().proposals = Some(set);

        info!(count = report.count, backend = %report.backend_used, query, "proposals generated");
        Ok(report)
    }

    /// Turns proposal indices into the single live active mask set.
    pub fn select(&self, indices: &[i64], query: Option<&str>) -> Result<SelectionSummary> {
        let query = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .unwrap_or(DEFAULT_SELECTION_QUERY);
        let intent = QueryIntent::parse(query);
        let policy = SelectionPolicy::new(self.config.confidence_band, self.config.selection_cap);

        let proposals = self
            .state
            .lock()
            .proposals
            .clone()
            .ok_or(EngineError::NoValidIndices { proposal_count: 0 })?;
        let chosen = policy.resolve(indices, &intent, &proposals.scores())?;
        let contours: Vec<Contour> = chosen
            .iter()
            .map(|&i| proposals.proposals[i].contour.clone())
            .filter(|c| c.len() >= 3)
            .collect();
        if contours.is_empty() {
            return Err(EngineError::EmptySelection);
        }

        // Built uncolored off the lock; only the cursor bump and swap are locked.
        let id = self.next_set_id.fetch_add(1, Ordering::Relaxed);
        let mut set = ActiveMaskSet::new(id, palette_color(0), query, contours, proposals.dims);
        let summary = SelectionSummary {
            set_id: id,
            applied: set.len(),
            indices: chosen,
            query: query.to_string(),
        };
        {
            let mut state = self.state.lock();
            set.color = palette_color(state.color_cursor);
            state.color_cursor += 1;
            state.active = vec![Arc::new(set)];
        }

        info!(set = id, masks = summary.applied, query, "selection applied");
        Ok(summary)
    }

    /// Removes every active set and the proposal set. Idempotent.
    pub fn clear(&self) -> String {
        let cleared = {
            let mut state = self.state.lock();
            let n = state.active.len();
            state.active.clear();
            state.proposals = None;
            state.color_cursor = 0;
            n
        };
        info!(cleared, "masks cleared");
        format!("Cleared {cleared} mask(s).")
    }

    /// Proposes with the default backend and selects the top candidates.
    pub async fn segment(&self, query: &str, frame: Option<&str>) -> Result<String> {
        let report = self.propose(query, frame, BackendChoice::Auto).await?;
        if report.count == 0 {
            return Ok(format!("No objects detected for '{query}'."));
        }
        let top = self.config.auto_select_top_k.min(report.count);
        let indices: Vec<i64> = (0..top as i64).collect();
        Ok(self.select(&indices, Some(query))?.to_string())
    }

    /// Overlays the active sets on one wire frame. Never fails: any problem
    /// yields the input unchanged.
    pub fn render_frame(&self, payload: &str) -> String {
        let sets = self.active_sets();
        if sets.is_empty() {
            if codec::sniff(payload).is_ok() {
                self.remember_frame(payload);
            }
            return payload.to_owned();
        }
        match self.overlay(payload, &sets) {
            Ok(out) => out,
            Err(err) => {
                warn!(%err, "render failed; passing frame through");
                payload.to_owned()
            }
        }
    }

    fn overlay(&self, payload: &str, sets: &[Arc<ActiveMaskSet>]) -> Result<String> {
        let frame = codec::decode(payload)?;
        self.remember_frame(payload);
        let style = OverlayStyle {
            fill_alpha: self.config.fill_alpha,
            outline_fraction: self.config.outline_fraction,
        };
        let out = composite(&frame.image, sets, style);
        Ok(codec::encode(&out, self.config.jpeg_quality)?)
    }

    /// Only payloads that carry an image are kept as the most recent frame, so
    /// a corrupt frame never hides an earlier good one.
    fn remember_frame(&self, payload: &str) {
        self.state.lock().latest_frame = Some(Arc::from(payload));
    }

    /// Counts a processed frame. True when a recalibration pass is due.
    pub fn frame_processed(&self) -> bool {
        self.scheduler.tick() && self.has_active_masks()
    }

    /// Reruns fast detection for every active set on `frame` and replaces the
    /// contours of sets that are still live. Sets whose rerun finds nothing
    /// keep their contours.
    pub fn recalibrate(&self, frame: &RgbImage) -> RecalibrationOutcome {
        let sets = self.active_sets();
        let fast = self.backends.fast();
        let dims = FrameDims::of(frame);

        let mut outcome = RecalibrationOutcome::default();
        let mut replacements = Vec::with_capacity(sets.len());
        for set in &sets {
            let contours = match fast.find_instances(frame, &set.query) {
                Ok(contours) => contours,
                Err(err) => {
                    warn!(%err, set = set.id, "recalibration detection failed");
                    outcome.kept += 1;
                    continue;
                }
            };
            let intent = QueryIntent::parse(&set.query);
            let proposals = build_proposals(contours, &intent, dims, self.config.proposal_limit);
            let scores: Vec<f64> = proposals.iter().map(|p| p.score).collect();
            let banded: Vec<Contour> = confidence_band(&scores, self.config.confidence_band)
                .into_iter()
                .take(self.config.selection_cap)
                .map(|i| proposals[i].contour.clone())
                .collect();
            if banded.is_empty() {
                debug!(set = set.id, "recalibration found nothing; keeping previous contours");
                outcome.kept += 1;
                continue;
            }
            replacements.push(Arc::new(set.with_contours(banded, dims)));
        }

        let mut state = self.state.lock();
        for replacement in replacements {
            if let Some(slot) = state.active.iter_mut().find(|s| s.id == replacement.id) {
                *slot = replacement;
                outcome.updated += 1;
            }
        }
        outcome
    }

    /// Recalibrates against the most recent frame on the CPU pool. `None`
    /// when a pass is already running or there is nothing to do.
    pub async fn recalibrate_latest(self: &Arc<Self>) -> Result<Option<RecalibrationOutcome>> {
        let Some(_guard) = self.scheduler.try_begin() else {
            return Ok(None);
        };
        let Some(payload) = self.latest_frame() else {
            return Ok(None);
        };
        if !self.has_active_masks() {
            return Ok(None);
        }

        let session = Arc::clone(self);
        let outcome = self
            .pool
            .run(move || -> Result<RecalibrationOutcome> {
                let frame = codec::decode(&payload)?;
                Ok(session.recalibrate(&frame.image))
            })
            .await??;
        Ok(Some(outcome))
    }

    /// Decodes the explicit frame if given, else the most recent one.
    async fn acquire_frame(&self, explicit: Option<&str>) -> Result<Arc<RgbImage>> {
        let candidates: Vec<Arc<str>> = explicit
            .filter(|f| !f.trim().is_empty())
            .map(Arc::from)
            .into_iter()
            .chain(self.latest_frame())
            .collect();

        for payload in candidates {
            match self.pool.run(move || codec::decode(&payload)).await? {
                Ok(frame) => return Ok(Arc::new(frame.into_image())),
                Err(err) => warn!(%err, "frame could not be decoded"),
            }
        }
        Err(EngineError::NoImage)
    }

    async fn run_backend(
        &self,
        resolved: &ResolvedBackend,
        image: &Arc<RgbImage>,
        query: &str,
    ) -> std::result::Result<Vec<Contour>, BackendError> {
        let budget = if resolved.heavy {
            self.config.heavy_timeout()
        } else {
            self.config.fast_timeout()
        };
        let name = resolved.finder.name().to_string();
        let finder = Arc::clone(&resolved.finder);
        let image = Arc::clone(image);
        let query = query.to_owned();

        let job = self.pool.run(move || finder.find_instances(&image, &query));
        match tokio::time::timeout(budget, job).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(BackendError::Failed {
                backend: name,
                reason: err.to_string(),
            }),
            Err(_) => Err(BackendError::Timeout {
                backend: name,
                millis: budget.as_millis() as u64,
            }),
        }
    }
}
