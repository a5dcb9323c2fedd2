use thiserror::Error;
use tracing::{Span, field, info, instrument, warn};

use crate::types::TelemetryRecord;
use crate::util::retry::Retry;

use super::config::PublishConfig;
use super::connection::{ChannelError, Connection, ConnectionState};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode telemetry: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("delivery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ChannelError },

    #[error("connection lost: {0}")]
    Disconnected(ChannelError),

    #[error("telemetry rejected: {0}")]
    Rejected(ChannelError),
}

/// State of the delivery of a single record
struct DeliveryAttempt<'a> {
    record: &'a TelemetryRecord,
    retry: Retry,
    last_error: Option<ChannelError>,
}

/// Delivers telemetry records over a [`Connection`].
pub struct Publisher {
    config: PublishConfig,
}

impl Publisher {
    pub fn new(config: PublishConfig) -> Self {
        Self { config }
    }

    /// Send a record, retrying on transient failures.
    ///
    /// Delivery is at-least-once: a send that reached the remote but whose
    /// response got lost is sent again on retry.
    ///
    /// The connection is never reopened here. If a send leaves it
    /// disconnected the call fails with [`PublishError::Disconnected`] and
    /// it is up to the caller to reconnect and publish again.
    #[instrument(name = "publish", skip_all, fields(attempts = field::Empty), err)]
    pub async fn publish(
        &self,
        record: &TelemetryRecord,
        connection: &mut Connection,
    ) -> Result<(), PublishError> {
        let payload = record.encode()?;
        let mut delivery = DeliveryAttempt {
            record,
            retry: self.config.retry.start(),
            last_error: None,
        };

        loop {
            let attempt = delivery.retry.begin();
            Span::current().record("attempts", attempt);

            let err = match connection.send(&payload).await {
                Ok(()) => {
                    info!("telemetry sent: {}", delivery.record);
                    return Ok(());
                }
                Err(err) => err,
            };

            if connection.state() != ConnectionState::Connected {
                return Err(PublishError::Disconnected(err));
            }
            if !err.is_transient() {
                return Err(PublishError::Rejected(err));
            }

            warn!(attempt, "send failed: {err}");
            let retry_after = err.retry_after();
            delivery.last_error = Some(err);
            if !delivery.retry.wait(retry_after).await {
                break;
            }
        }

        Err(PublishError::Exhausted {
            attempts: delivery.retry.attempts(),
            // the loop only exits after recording a transient error
            last: delivery.last_error.unwrap_or(ChannelError::Timeout),
        })
    }
}
