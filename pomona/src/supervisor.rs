use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::remote::{
    ChannelConfig, ChannelError, Connection, DeviceCredential, ProvisioningConfig,
    ProvisioningError, PublishError, Publisher, provision,
};
use crate::sensing::{Analyze, Capture, Orchestrator};
use crate::types::TelemetryRecord;
use crate::util::retry::{Retry, RetryPolicy};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("unable to connect after {attempts} attempts: {last}")]
    Connect { attempts: u32, last: ChannelError },
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Bounds the attempts to open the connection, both at startup and
    /// after losing it
    pub connect_retry: RetryPolicy,

    /// Time an in-flight cycle is given to finish once cancelled
    pub grace_period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_retry: RetryPolicy::default(),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Owns the device lifecycle: provisioning, the connection and the
/// capture/publish loop.
pub struct Supervisor<C, A> {
    orchestrator: Orchestrator<C, A>,
    publisher: Publisher,
    channel: ChannelConfig,
    config: SupervisorConfig,
}

impl<C: Capture, A: Analyze> Supervisor<C, A> {
    pub fn new(
        orchestrator: Orchestrator<C, A>,
        publisher: Publisher,
        channel: ChannelConfig,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            orchestrator,
            publisher,
            channel,
            config,
        }
    }

    /// Provision the device and run capture cycles until `cancel` is
    /// triggered.
    ///
    /// Returns `Ok` only on cancellation. Provisioning failures and running
    /// out of connection attempts are fatal, everything else is logged and
    /// the loop moves on to the next cycle.
    #[instrument(name = "supervise", skip_all, err)]
    pub async fn run(
        &self,
        credential: &DeviceCredential,
        provisioning: &ProvisioningConfig,
        cancel: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let session = tokio::select! {
            res = provision(credential, provisioning) => res?,
            _ = cancel.cancelled() => {
                info!("cancelled before provisioning finished");
                return Ok(());
            }
        };

        let mut connection = Connection::new(session, self.channel.clone());
        let res = self.run_loop(&mut connection, &cancel).await;

        // whatever happened, do not leave the channel open
        connection.close();
        res
    }

    async fn run_loop(
        &self,
        connection: &mut Connection,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        tokio::select! {
            res = self.connect(connection) => res?,
            _ = cancel.cancelled() => return Ok(()),
        }

        while !cancel.is_cancelled() {
            let cycle = self.cycle(connection);
            tokio::pin!(cycle);

            tokio::select! {
                res = &mut cycle => res?,
                _ = cancel.cancelled() => {
                    info!("shutdown requested, waiting for the current cycle");
                    match timeout(self.config.grace_period, &mut cycle).await {
                        Ok(res) => res?,
                        Err(_) => warn!(
                            "cycle did not finish within {:?}, aborting",
                            self.config.grace_period
                        ),
                    }
                    break;
                }
            }

            tokio::select! {
                _ = sleep(self.orchestrator.interval()) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("shutting down");
        Ok(())
    }

    /// Run a capture cycle and publish the result
    async fn cycle(&self, connection: &mut Connection) -> Result<(), SupervisorError> {
        let record = match self.orchestrator.run_cycle().await {
            Ok(record) => record,
            Err(err) => {
                warn!(step = %err.step(), "cycle failed: {err}");
                return Ok(());
            }
        };

        self.deliver(&record, connection).await
    }

    /// Publish the record, reconnecting as many times as the retry policy
    /// allows if the connection is lost on the way
    async fn deliver(
        &self,
        record: &TelemetryRecord,
        connection: &mut Connection,
    ) -> Result<(), SupervisorError> {
        let mut retry = self.config.connect_retry.start();
        loop {
            match self.publisher.publish(record, connection).await {
                Ok(()) => return Ok(()),
                Err(PublishError::Disconnected(err)) => {
                    warn!(step = "publish", "connection lost: {err}");
                    self.reconnect(connection, &mut retry, err).await?;
                }
                Err(err) => {
                    warn!(step = "publish", "record dropped: {err}");
                    return Ok(());
                }
            }
        }
    }

    async fn connect(&self, connection: &mut Connection) -> Result<(), SupervisorError> {
        let mut retry = self.config.connect_retry.start();
        let attempt = retry.begin();
        match connection.open().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(attempt, "failed to connect: {err}");
                self.reconnect(connection, &mut retry, err).await
            }
        }
    }

    /// Reopen the connection, backing off between attempts.
    ///
    /// `last` is the error that caused the connection to be lost, it is
    /// reported if no further attempts are left.
    async fn reconnect(
        &self,
        connection: &mut Connection,
        retry: &mut Retry,
        mut last: ChannelError,
    ) -> Result<(), SupervisorError> {
        loop {
            let Some(delay) = retry.backoff(None) else {
                return Err(SupervisorError::Connect {
                    attempts: retry.attempts(),
                    last,
                });
            };
            sleep(delay).await;

            let attempt = retry.begin();
            match connection.open().await {
                Ok(()) => {
                    info!(attempt, "connected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, "failed to connect: {err}");
                    last = err;
                }
            }
        }
    }
}
