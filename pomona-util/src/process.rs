use std::ffi::{OsStr, OsString};
use std::fmt::{self, Display};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::trace;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn '{0}': {1}")]
    Spawn(String, #[source] io::Error),

    #[error("command failed with code: {0}: {1}")]
    ExitStatus(i32, String),

    #[error("command was terminated by a signal: {0}")]
    Terminated(String),

    #[error("command did not finish within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
#[error("command line must not be empty")]
pub struct EmptyCommandError;

/// A program invocation, without going through a shell.
///
/// Arguments are kept as OS strings so paths reach the child unchanged,
/// even when they are not valid UTF-8.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    cmd: String,
    args: Vec<OsString>,
    workdir: Option<PathBuf>,
}

impl Command {
    pub fn new<S: AsRef<str>>(cmd: S) -> Self {
        Self {
            cmd: cmd.as_ref().to_owned(),
            args: Vec::new(),
            workdir: None,
        }
    }

    pub fn args<S: AsRef<OsStr>>(mut self, args: &[S]) -> Self {
        self.args = args.iter().map(|s| s.as_ref().to_owned()).collect();
        self
    }

    /// Append a single argument
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn workdir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.workdir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.cmd
    }
}

/// Parse a whitespace separated command line, e.g. `fswebcam -r 640x480`.
///
/// There is no quoting support, arguments cannot contain spaces.
impl FromStr for Command {
    type Err = EmptyCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let cmd = parts.next().ok_or(EmptyCommandError)?;
        let args: Vec<&str> = parts.collect();
        Ok(Command::new(cmd).args(&args))
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cmd)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Run a command to completion and return its standard output.
///
/// The child is killed if it does not exit within `limit`, or if the
/// returned future is dropped before completion.
pub async fn run(command: &Command, limit: Duration) -> Result<Vec<u8>, Error> {
    let mut cmd = tokio::process::Command::new(&command.cmd);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(workdir) = &command.workdir {
        cmd.current_dir(workdir);
    }

    trace!("running {command}");
    let child = cmd
        .spawn()
        .map_err(|e| Error::Spawn(command.cmd.clone(), e))?;

    // the child is dropped, and killed, if the timeout elapses
    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| Error::Timeout(limit))?
        .map_err(|e| Error::Spawn(command.cmd.clone(), e))?;

    if output.status.success() {
        return Ok(output.stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    match output.status.code() {
        Some(code) => Err(Error::ExitStatus(code, stderr)),
        None => Err(Error::Terminated(output.status.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parses_command_lines() {
        let cmd: Command = "fswebcam  -r 640x480 --no-banner".parse().unwrap();

        assert_eq!(cmd.program(), "fswebcam");
        assert_eq!(cmd.to_string(), "fswebcam -r 640x480 --no-banner");
        assert!("   ".parse::<Command>().is_err());
    }

    #[tokio::test]
    async fn test_returns_stdout() {
        let cmd = Command::new("/bin/sh").args(&["-c", "echo hello world"]);
        let stdout = run(&cmd, Duration::from_secs(5)).await.unwrap();

        assert_eq!(String::from_utf8(stdout).unwrap(), "hello world\n");
    }

    #[tokio::test]
    async fn test_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = Command::new("/bin/sh")
            .args(&["-c", "touch marker"])
            .workdir(dir.path());
        run(&cmd, Duration::from_secs(5)).await.unwrap();

        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_passes_non_utf8_arguments_unchanged() {
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(OsStr::from_bytes(b"obs\xff.jpg"));
        let cmd = Command::new("/bin/sh")
            .args(&["-c", "touch \"$0\""])
            .arg(&path);
        run(&cmd, Duration::from_secs(5)).await.unwrap();

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_reports_exit_code_and_stderr() {
        let cmd = Command::new("/bin/sh").args(&["-c", "echo no camera >&2; exit 42"]);
        let res = run(&cmd, Duration::from_secs(5)).await;

        match res {
            Err(Error::ExitStatus(code, stderr)) => {
                assert_eq!(code, 42);
                assert_eq!(stderr, "no camera");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reports_spawn_failures() {
        let cmd = Command::new("/nonexistent/command");
        let res = run(&cmd, Duration::from_secs(5)).await;

        assert!(matches!(res, Err(Error::Spawn(_, _))));
    }

    #[tokio::test]
    async fn test_kills_commands_that_take_too_long() {
        let cmd = Command::new("/bin/sh").args(&["-c", "sleep 10"]);
        let start = std::time::Instant::now();
        let res = run(&cmd, Duration::from_millis(100)).await;

        assert!(matches!(res, Err(Error::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
