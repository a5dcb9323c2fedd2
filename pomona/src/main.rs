use std::error::Error;
use std::path::PathBuf;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;
mod supervisor;

use pomona_remote as remote;
use pomona_remote_types as types;
use pomona_sensing as sensing;
use pomona_util as util;

use crate::cli::Cli;
use crate::remote::{
    ChannelConfig, DeviceCredential, ProvisioningConfig, PublishConfig, Publisher,
};
use crate::sensing::{CommandAnalyzer, CommandCapture, CycleConfig, Orchestrator};
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::types::Categories;
use crate::util::retry::RetryPolicy;

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("debug".parse().unwrap())
                    .add_directive("hyper=error".parse().unwrap())
                    .add_directive("hyper_util=error".parse().unwrap())
                    .add_directive("reqwest=info".parse().unwrap()),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

/// Cancel the token on the first SIGTERM or SIGINT
fn handle_signals(cancel: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        cancel.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    initialize_tracing();

    let cli = cli::parse();

    let work_dir = match &cli.work_dir {
        Some(dir) => dir.clone(),
        // make sure the runtime dir exists
        None => util::dirs::ensure_runtime_dir()?,
    };

    let credential = DeviceCredential {
        id_scope: cli.id_scope.clone(),
        registration_id: cli.registration_id.clone(),
        symmetric_key: cli.symmetric_key.clone(),
    };

    let provisioning_config = provisioning_config(&cli);
    let channel_config = channel_config(&cli);
    let cycle_config = cycle_config(&cli, work_dir)?;

    let capture_defaults = CommandCapture::default();
    let capture = CommandCapture::new(
        cli.capture_command
            .clone()
            .unwrap_or_else(|| capture_defaults.command().clone()),
        cli.capture_timeout.unwrap_or(capture_defaults.timeout()),
    );

    let analyzer_defaults = CommandAnalyzer::default();
    let mut analysis_command = cli
        .analysis_command
        .clone()
        .unwrap_or_else(|| analyzer_defaults.command().clone());
    if let Some(dir) = &cli.analysis_workdir {
        analysis_command = analysis_command.workdir(dir);
    }
    let analyzer = CommandAnalyzer::new(
        analysis_command,
        cli.analysis_timeout.unwrap_or(analyzer_defaults.timeout()),
    );

    let publisher = Publisher::new(PublishConfig {
        retry: retry_policy(cli.publish_attempts),
    });
    let supervisor_defaults = SupervisorConfig::default();
    let supervisor_config = SupervisorConfig {
        connect_retry: retry_policy(cli.connect_attempts),
        grace_period: cli.grace_period.unwrap_or(supervisor_defaults.grace_period),
    };

    trace!(
        credential = ?credential,
        provisioning = ?provisioning_config,
        channel = ?channel_config,
        cycle = ?cycle_config,
        supervisor = ?supervisor_config,
        "using config:"
    );

    let cancel = CancellationToken::new();
    handle_signals(cancel.clone())?;

    let supervisor = Supervisor::new(
        Orchestrator::new(capture, analyzer, cycle_config),
        publisher,
        channel_config,
        supervisor_config,
    );
    supervisor
        .run(&credential, &provisioning_config, cancel)
        .await?;

    Ok(())
}

fn provisioning_config(cli: &Cli) -> ProvisioningConfig {
    let defaults = ProvisioningConfig::default();
    ProvisioningConfig {
        endpoint: cli
            .provisioning_endpoint
            .clone()
            .unwrap_or(defaults.endpoint.clone()),
        request_timeout: cli.request_timeout.unwrap_or(defaults.request_timeout),
        deadline: cli.provisioning_timeout.unwrap_or(defaults.deadline),
        ..defaults
    }
}

fn channel_config(cli: &Cli) -> ChannelConfig {
    let defaults = ChannelConfig::default();
    ChannelConfig {
        request_timeout: cli.request_timeout.unwrap_or(defaults.request_timeout),
        ..defaults
    }
}

fn cycle_config(cli: &Cli, work_dir: PathBuf) -> Result<CycleConfig, Box<dyn Error>> {
    let defaults = CycleConfig::new(work_dir);
    let categories = if cli.categories.is_empty() {
        defaults.categories.clone()
    } else {
        Categories::new(cli.categories.iter().cloned())?
    };

    Ok(CycleConfig {
        interval: cli.interval.unwrap_or(defaults.interval),
        categories,
        ..defaults
    })
}

fn retry_policy(max_attempts: Option<u32>) -> RetryPolicy {
    let defaults = RetryPolicy::default();
    RetryPolicy {
        max_attempts: max_attempts.unwrap_or(defaults.max_attempts),
        ..defaults
    }
}
