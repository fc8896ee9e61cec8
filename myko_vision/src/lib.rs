// THEORY:
// This file is the main entry point for the `myko_vision` library crate, the
// live segmentation overlay engine for microscope video.
//
// The public face is the `Session` (in `pipeline`): `propose`, `select`,
// `clear`, `segment` for the conversational caller and `render_frame` for the
// frame stream. `parallel_pipeline` holds the concurrency shell that feeds a
// stream of frames through the session. `backend` defines the one capability
// every instance-finding strategy shares. The pixel-level stages live in
// `core_modules` and are public so the offline tester and the integration
// tests can drive them individually.

pub mod backend;
pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use backend::{BackendChoice, FastBackend, InstanceFinder};
pub use config::{DetectionConfig, EngineConfig, SeparatorMode};
pub use core_modules::contour::{Contour, FrameDims, NormalizedContour};
pub use core_modules::proposal::{CandidateSummary, ProposalReport};
pub use error::{BackendError, CodecError, EngineError, PoolError};
pub use parallel_pipeline::{FrameProcessor, ProcessorStats, latest_frame_slot, run_stream};
pub use pipeline::{RecalibrationOutcome, SelectionSummary, Session};
