use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::util::process::{self, Command};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("detector failed: {0}")]
    Command(#[from] process::Error),

    #[error("detector produced no results at {0}")]
    MissingOutput(PathBuf),

    #[error("failed to read {0}: {1}")]
    Unreadable(PathBuf, #[source] io::Error),

    #[error("failed to write detector results: {0}")]
    Write(#[source] io::Error),
}

/// Runs detection over an observation
pub trait Analyze {
    /// Analyze the observation at `input` and write the raw detector
    /// results to `output`.
    fn analyze(
        &self,
        input: &Path,
        output: &Path,
    ) -> impl Future<Output = Result<(), AnalysisError>> + Send;
}

/// Run an external detector over the observation.
///
/// The input path is appended as the last argument of the command and
/// whatever the detector prints on standard output is stored as the
/// analysis result.
#[derive(Clone, Debug)]
pub struct CommandAnalyzer {
    command: Command,
    timeout: Duration,
}

impl CommandAnalyzer {
    pub fn new(command: Command, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for CommandAnalyzer {
    fn default() -> Self {
        Self::new(
            Command::new("./darknet").args(&[
                "detector",
                "test",
                "cfg/coco.data",
                "cfg/custom-yolov4-tiny-detector.cfg",
                "backup/custom-yolov4-tiny-detector_last.weights",
            ]),
            Duration::from_secs(120),
        )
    }
}

impl Analyze for CommandAnalyzer {
    #[instrument(name = "analysis", skip_all, err)]
    async fn analyze(&self, input: &Path, output: &Path) -> Result<(), AnalysisError> {
        if !tokio::fs::try_exists(input)
            .await
            .map_err(|e| AnalysisError::Unreadable(input.to_path_buf(), e))?
        {
            return Err(AnalysisError::Unreadable(
                input.to_path_buf(),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }

        let command = self.command.clone().arg(input);
        let stdout = process::run(&command, self.timeout).await?;

        tokio::fs::write(output, &stdout)
            .await
            .map_err(AnalysisError::Write)?;
        debug!("detector results written to {}", output.display());

        Ok(())
    }
}
