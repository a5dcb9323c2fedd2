use std::time::Duration;

use crate::util::http::Uri;
use crate::util::retry::RetryPolicy;
use crate::util::types::{IdScope, RegistrationId, SymmetricKey};

/// Enrollment credentials of the device.
///
/// Loaded once at startup and never modified. Every field is validated to
/// be non-empty when parsed. The key is redacted from any debug output.
#[derive(Clone, Debug)]
pub struct DeviceCredential {
    pub id_scope: IdScope,
    pub registration_id: RegistrationId,
    pub symmetric_key: SymmetricKey,
}

/// Provisioning service configuration
#[derive(Clone, Debug)]
pub struct ProvisioningConfig {
    pub endpoint: Uri,

    pub api_version: String,

    /// Timeout of every individual request to the provisioning service
    pub request_timeout: Duration,

    /// Give up on provisioning if no assignment is received within this time
    pub deadline: Duration,

    /// Wait between operation status queries when the service does not
    /// send a `Retry-After` header
    pub poll_interval: Duration,

    pub token_ttl: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            endpoint: Uri::from_static("https://global.azure-devices-provisioning.net"),
            api_version: "2021-06-01".to_owned(),
            request_timeout: Duration::from_millis(30_000),
            deadline: Duration::from_millis(120_000),
            poll_interval: Duration::from_millis(3_000),
            token_ttl: Duration::from_secs(3600),
        }
    }
}

/// Messaging channel configuration
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub api_version: String,

    /// Timeout of a single send
    pub request_timeout: Duration,

    /// Lifetime of the access token minted when the channel is opened
    pub token_ttl: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            api_version: "2020-03-13".to_owned(),
            request_timeout: Duration::from_millis(30_000),
            token_ttl: Duration::from_secs(3600),
        }
    }
}

/// Telemetry delivery configuration
#[derive(Clone, Debug, Default)]
pub struct PublishConfig {
    pub retry: RetryPolicy,
}
