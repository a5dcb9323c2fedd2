use std::fmt::{self, Display};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::analysis::{AnalysisError, Analyze};
use crate::capture::{Capture, CaptureError};
use crate::parse::parse_detections;
use crate::types::{Categories, TelemetryRecord};

const OBSERVATION_FILE: &str = "observation.jpg";
const RESULT_FILE: &str = "result.txt";

#[derive(Clone, Debug)]
pub struct CycleConfig {
    /// Directory for the per-cycle artifacts
    pub work_dir: PathBuf,

    /// Wait between the end of a cycle and the start of the next
    pub interval: Duration,

    pub categories: Categories,
}

impl CycleConfig {
    pub fn new<P: AsRef<Path>>(work_dir: P) -> Self {
        Self {
            work_dir: work_dir.as_ref().to_path_buf(),
            interval: Duration::from_secs(10),
            categories: Categories::default(),
        }
    }

    fn observation_path(&self) -> PathBuf {
        self.work_dir.join(OBSERVATION_FILE)
    }

    fn result_path(&self) -> PathBuf {
        self.work_dir.join(RESULT_FILE)
    }
}

/// The cycle step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Capture,
    Analysis,
}

impl Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Capture => f.write_str("capture"),
            Step::Analysis => f.write_str("analysis"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

impl CycleError {
    pub fn step(&self) -> Step {
        match self {
            CycleError::Capture(_) => Step::Capture,
            CycleError::Analysis(_) => Step::Analysis,
        }
    }
}

/// Drives a single observation cycle: capture, analysis and parsing of the
/// detector results into a [`TelemetryRecord`].
pub struct Orchestrator<C, A> {
    capture: C,
    analyzer: A,
    config: CycleConfig,
}

impl<C: Capture, A: Analyze> Orchestrator<C, A> {
    pub fn new(capture: C, analyzer: A, config: CycleConfig) -> Self {
        Self {
            capture,
            analyzer,
            config,
        }
    }

    /// Time to wait after a cycle ends before running the next one
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Run a full cycle and return the resulting record.
    ///
    /// A record is only returned once both capture and analysis have
    /// succeeded for this cycle. It always contains every configured
    /// category.
    #[instrument(name = "cycle", skip_all, err)]
    pub async fn run_cycle(&self) -> Result<TelemetryRecord, CycleError> {
        let observation = self.config.observation_path();
        let result = self.config.result_path();

        // leftovers from an earlier cycle must never be reported as new
        remove_artifact(&observation)
            .await
            .map_err(CaptureError::Prepare)?;
        remove_artifact(&result).await.map_err(AnalysisError::Write)?;

        self.capture.capture(&observation).await?;
        let analysis = self.analyzer.analyze(&observation, &result).await;

        // the observation is only needed for the analysis
        if let Err(e) = remove_artifact(&observation).await {
            warn!("failed to remove {}: {e}", observation.display());
        }
        analysis?;

        let output = match tokio::fs::read(&result).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AnalysisError::MissingOutput(result).into());
            }
            Err(e) => return Err(AnalysisError::Unreadable(result, e).into()),
        };

        let output = String::from_utf8_lossy(&output);
        let record = parse_detections(&output, &self.config.categories);
        info!("parsed detection results: {record}");

        Ok(record)
    }
}

async fn remove_artifact(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
