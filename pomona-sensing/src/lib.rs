//! Observation cycle of the agent.
//!
//! A cycle captures an observation with an external program, runs an
//! external detector on it and turns the detector output into a
//! [`TelemetryRecord`](pomona_remote_types::TelemetryRecord). Neither the
//! capture nor the detection algorithms live here, both are pluggable
//! through the [`Capture`] and [`Analyze`] traits.

mod analysis;
mod capture;
mod cycle;
mod parse;

pub use analysis::{Analyze, AnalysisError, CommandAnalyzer};
pub use capture::{Capture, CaptureError, CommandCapture};
pub use cycle::{CycleConfig, CycleError, Orchestrator, Step};
pub use parse::parse_detections;

use pomona_remote_types as types;
use pomona_util as util;
