use std::fmt::{self, Display};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{Span, debug, field, info, instrument, warn};

use crate::util::crypto::SasToken;
use crate::util::http::{Uri, retry_after};

use super::config::ChannelConfig;
use super::provisioning::Session;

/// Lifecycle of the channel to the hub.
///
/// ```text
/// Disconnected -> Connecting -> Connected
///      ^              |             |
///      +--------------+-------------+  (handshake failure / transport error)
///
/// any state -> Closing -> Closed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,

    #[error("channel is closed")]
    Closed,

    #[error("channel handshake failed: {0}")]
    Handshake(String),

    #[error("access token expired")]
    TokenExpired,

    #[error("send timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("remote is unavailable: {0}")]
    Unavailable(StatusCode, Option<Duration>),

    #[error("remote refused credentials: {0}")]
    Unauthorized(StatusCode),

    #[error("remote rejected message: ({0}) {1}")]
    Rejected(StatusCode, String),
}

impl ChannelError {
    /// Whether sending again on the same connection may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Timeout | ChannelError::Unavailable(..))
    }

    /// Wait requested by the remote before trying again
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ChannelError::Unavailable(_, retry_after) => *retry_after,
            _ => None,
        }
    }
}

struct Channel {
    client: Client,
    endpoint: String,
    token_expiry: u64,
}

/// The single connection to the assigned hub.
///
/// Sends are never retried or reconnected implicitly. When a send moves the
/// connection back to `Disconnected`, the owner must call
/// [`Connection::open`] again before the next send.
pub struct Connection {
    session: Session,
    config: ChannelConfig,
    state: ConnectionState,
    channel: Option<Channel>,
}

impl Connection {
    pub fn new(session: Session, config: ChannelConfig) -> Self {
        Self {
            session,
            config,
            state: ConnectionState::Disconnected,
            channel: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Open the channel, minting a fresh access token.
    ///
    /// No request is made to the hub, `Connected` only means a valid token
    /// was minted. Reachability is known after the first send.
    ///
    /// Opening an already connected channel is a no-op.
    #[instrument(name = "open", skip_all, fields(endpoint = %self.session.endpoint()), err)]
    pub async fn open(&mut self) -> Result<(), ChannelError> {
        match self.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(ChannelError::Closed);
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }

        self.state = ConnectionState::Connecting;
        match self.handshake() {
            Ok(channel) => {
                self.channel = Some(channel);
                self.state = ConnectionState::Connected;
                info!("connected");
                Ok(())
            }
            Err(err) => {
                self.channel = None;
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    fn handshake(&self) -> Result<Channel, ChannelError> {
        let host = self
            .session
            .endpoint()
            .host()
            .ok_or_else(|| ChannelError::Handshake("endpoint has no host".to_owned()))?;
        let device_id = self.session.device_id();

        let token = SasToken::sign_for(
            self.session.key(),
            &format!("{host}/devices/{device_id}"),
            None,
            self.config.token_ttl,
        )
        .map_err(|e| ChannelError::Handshake(e.to_string()))?;

        let mut auth = HeaderValue::from_str(&token.header_value())
            .map_err(|e| ChannelError::Handshake(e.to_string()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|e| ChannelError::Handshake(e.to_string()))?;

        let endpoint = Uri::from_parts(
            self.session.endpoint().clone(),
            &format!("/devices/{device_id}/messages/events"),
            Some(&format!("api-version={}", self.config.api_version)),
        )
        .map_err(|e| ChannelError::Handshake(e.to_string()))?;

        debug!("token valid until {}", token.expiry());
        Ok(Channel {
            client,
            endpoint: endpoint.to_string(),
            token_expiry: token.expiry(),
        })
    }

    /// Send a single message over the channel.
    ///
    /// Fails with [`ChannelError::NotConnected`] if the channel is not open.
    #[instrument(name = "send", skip_all, fields(status = field::Empty))]
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        if self.state != ConnectionState::Connected {
            return Err(ChannelError::NotConnected);
        }
        let Some(channel) = self.channel.as_ref() else {
            return Err(ChannelError::NotConnected);
        };

        if unix_now() >= channel.token_expiry {
            self.disconnect();
            return Err(ChannelError::TokenExpired);
        }

        let response = channel
            .client
            .post(&channel.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header("iothub-contenttype", "application/json")
            .header("iothub-contentencoding", "utf-8")
            .body(payload.to_vec())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err(ChannelError::Timeout),
            Err(e) => {
                self.disconnect();
                return Err(ChannelError::Transport(e));
            }
        };

        let status = response.status();
        Span::current().record("status", status.as_u16());

        match status {
            status if status.is_success() => Ok(()),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => Err(
                ChannelError::Unavailable(status, retry_after(response.headers())),
            ),
            StatusCode::REQUEST_TIMEOUT => Err(ChannelError::Unavailable(status, None)),
            status if status.is_server_error() => Err(ChannelError::Unavailable(status, None)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.disconnect();
                Err(ChannelError::Unauthorized(status))
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(ChannelError::Rejected(status, body))
            }
        }
    }

    /// Close the channel and release its resources.
    ///
    /// Closing more than once is a no-op.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        self.channel = None;
        self.state = ConnectionState::Closed;
        info!("connection closed");
    }

    fn disconnect(&mut self) {
        warn!("connection lost");
        self.channel = None;
        self.state = ConnectionState::Disconnected;
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
