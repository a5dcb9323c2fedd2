/*
This module is home to everything related to the cloud backend the device
reports to.

It provides tools to perform device provisioning, manage the channel to the
assigned hub and deliver telemetry over it, while obeying backend
constraints such as retry and backoff on errors.
*/

mod config;
mod connection;
mod provisioning;
mod publish;

pub use config::{ChannelConfig, DeviceCredential, ProvisioningConfig, PublishConfig};
pub use connection::{ChannelError, Connection, ConnectionState};
pub use provisioning::{
    ProvisioningError, ProvisioningResult, ProvisioningStatus, Session, provision,
};
pub use publish::{PublishError, Publisher};

use pomona_remote_types as types;
use pomona_util as util;
