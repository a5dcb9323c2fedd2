use clap::Parser;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::Category;
use crate::util::http::Uri;
use crate::util::process::Command;
use crate::util::types::{IdScope, RegistrationId, SymmetricKey};

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

fn parse_endpoint(s: &str) -> Result<Uri, String> {
    Uri::from_host(s).map_err(|e| e.to_string())
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// ID scope of the device provisioning service
    #[arg(env = "POMONA_ID_SCOPE", long = "id-scope", value_name = "scope")]
    pub id_scope: IdScope,

    /// Registration ID of this device
    #[arg(
        env = "POMONA_REGISTRATION_ID",
        long = "registration-id",
        value_name = "id"
    )]
    pub registration_id: RegistrationId,

    /// Base64 encoded symmetric key of the device enrollment
    #[arg(
        env = "POMONA_SYMMETRIC_KEY",
        long = "symmetric-key",
        value_name = "key",
        hide_env_values = true
    )]
    pub symmetric_key: SymmetricKey,

    /// Device provisioning service host or URI
    #[arg(
        env = "POMONA_PROVISIONING_ENDPOINT",
        long = "provisioning-endpoint",
        value_name = "uri",
        value_parser = parse_endpoint
    )]
    pub provisioning_endpoint: Option<Uri>,

    /// Give up provisioning after this many milliseconds
    #[arg(
        env = "POMONA_PROVISIONING_TIMEOUT_MS",
        long = "provisioning-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub provisioning_timeout: Option<Duration>,

    /// Remote request timeout in milliseconds
    #[arg(
        env = "POMONA_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub request_timeout: Option<Duration>,

    /// Time between the end of a cycle and the start of the next, in milliseconds
    #[arg(
        env = "POMONA_INTERVAL_MS",
        long = "interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub interval: Option<Duration>,

    /// Category to report, can be repeated
    #[arg(
        env = "POMONA_CATEGORIES",
        long = "category",
        value_name = "name",
        value_delimiter = ','
    )]
    pub categories: Vec<Category>,

    /// Command used to take an observation, the image path is appended
    #[arg(
        env = "POMONA_CAPTURE_COMMAND",
        long = "capture-command",
        value_name = "cmd"
    )]
    pub capture_command: Option<Command>,

    /// Capture timeout in milliseconds
    #[arg(
        env = "POMONA_CAPTURE_TIMEOUT_MS",
        long = "capture-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub capture_timeout: Option<Duration>,

    /// Detector command, the image path is appended
    #[arg(
        env = "POMONA_ANALYSIS_COMMAND",
        long = "analysis-command",
        value_name = "cmd"
    )]
    pub analysis_command: Option<Command>,

    /// Detector timeout in milliseconds
    #[arg(
        env = "POMONA_ANALYSIS_TIMEOUT_MS",
        long = "analysis-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub analysis_timeout: Option<Duration>,

    /// Directory the detector runs in, relative paths in its command resolve from here
    #[arg(
        env = "POMONA_ANALYSIS_WORKDIR",
        long = "analysis-workdir",
        value_name = "dir"
    )]
    pub analysis_workdir: Option<PathBuf>,

    /// Directory for capture and analysis artifacts
    #[arg(env = "POMONA_WORK_DIR", long = "work-dir", value_name = "dir")]
    pub work_dir: Option<PathBuf>,

    /// Maximum send attempts for a single record
    #[arg(
        env = "POMONA_PUBLISH_ATTEMPTS",
        long = "publish-attempts",
        value_name = "int",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub publish_attempts: Option<u32>,

    /// Maximum connection attempts before giving up
    #[arg(
        env = "POMONA_CONNECT_ATTEMPTS",
        long = "connect-attempts",
        value_name = "int",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub connect_attempts: Option<u32>,

    /// Time given to an in-flight cycle to finish on shutdown, in milliseconds
    #[arg(
        env = "POMONA_GRACE_PERIOD_MS",
        long = "grace-period-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub grace_period: Option<Duration>,
}

pub fn parse() -> Cli {
    Parser::parse()
}
