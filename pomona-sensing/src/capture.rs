use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::util::process::{self, Command};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture command failed: {0}")]
    Command(#[from] process::Error),

    #[error("capture produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("failed to prepare capture: {0}")]
    Prepare(#[source] io::Error),
}

/// Produces an observation file
pub trait Capture {
    /// Take an observation and write it to `output`.
    ///
    /// On success the file at `output` must exist.
    fn capture(&self, output: &Path) -> impl Future<Output = Result<(), CaptureError>> + Send;
}

/// Capture an observation by running an external program.
///
/// The output path is appended as the last argument of the command, e.g.
/// `fswebcam -r 640x480 --no-banner /run/pomona/observation.jpg`.
#[derive(Clone, Debug)]
pub struct CommandCapture {
    command: Command,
    timeout: Duration,
}

impl CommandCapture {
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

impl Default for CommandCapture {
    fn default() -> Self {
        Self::new(
            Command::new("fswebcam").args(&["-r", "640x480", "--no-banner"]),
            Duration::from_secs(30),
        )
    }
}

impl Capture for CommandCapture {
    #[instrument(name = "capture", skip_all, err)]
    async fn capture(&self, output: &Path) -> Result<(), CaptureError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(CaptureError::Prepare)?;
        }

        let command = self.command.clone().arg(output);
        process::run(&command, self.timeout).await?;

        // a zero exit status is not enough, some cameras fail silently
        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(CaptureError::MissingOutput(output.to_path_buf()));
        }
        debug!("observation written to {}", output.display());

        Ok(())
    }
}
