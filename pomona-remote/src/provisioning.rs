use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{Span, debug, field, info, instrument, trace};

use crate::util::crypto::{SasToken, SignatureError};
use crate::util::http::{InvalidUriError, Uri, retry_after};
use crate::util::types::{DeviceId, EmptyValueError, SymmetricKey};

use super::config::{DeviceCredential, ProvisioningConfig};

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Invalid remote endpoint URI: {0}")]
    InvalidRemote(#[from] InvalidUriError),

    #[error("Failed to sign registration request: {0}")]
    Signature(#[from] SignatureError),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Remote returned error: ({0}) {1}")]
    Status(StatusCode, String),

    #[error("Registration was rejected: {0}")]
    Rejected(String),

    #[error("Malformed registration response: {0}")]
    Malformed(String),

    #[error("No assignment received within {0:?}")]
    Timeout(Duration),
}

impl From<EmptyValueError> for ProvisioningError {
    fn from(value: EmptyValueError) -> Self {
        ProvisioningError::Malformed(value.to_string())
    }
}

/// Outcome of a registration as reported by the provisioning service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisioningStatus {
    Assigned,
    Failed,
    /// The service is still working on the assignment
    Retrying,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisioningResult {
    pub status: ProvisioningStatus,
    /// Hub the device was assigned to. Present iff the status is `Assigned`
    pub assigned_hub: Option<String>,
    pub device_id: Option<String>,
    pub error_message: Option<String>,
}

/*
    request {
        registrationId
        payload?
    }
*/
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    registration_id: &'a str,
}

/*
    response {
        operationId,
        status: assigning | assigned | failed | disabled | unassigned,
        registrationState?: {
            registrationId,
            assignedHub?,
            deviceId?,
            status,
            errorCode?,
            errorMessage?,
        }
    }
*/
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationOperation {
    operation_id: Option<String>,
    status: Option<String>,
    registration_state: Option<RegistrationState>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    assigned_hub: Option<String>,
    device_id: Option<String>,
    status: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<&RegistrationOperation> for ProvisioningResult {
    type Error = ProvisioningError;

    fn try_from(operation: &RegistrationOperation) -> Result<Self, Self::Error> {
        let state = operation.registration_state.as_ref();

        // completed registrations may only report the status in the
        // registration state
        let status = operation
            .status
            .as_deref()
            .or_else(|| state.and_then(|s| s.status.as_deref()))
            .ok_or_else(|| ProvisioningError::Malformed("missing status".to_owned()))?;

        let status = match status {
            "assigned" => ProvisioningStatus::Assigned,
            "assigning" => ProvisioningStatus::Retrying,
            "failed" | "disabled" | "unassigned" => ProvisioningStatus::Failed,
            other => {
                return Err(ProvisioningError::Malformed(format!(
                    "unknown status '{other}'"
                )));
            }
        };

        let assigned_hub = state
            .and_then(|s| s.assigned_hub.clone())
            .filter(|hub| !hub.trim().is_empty());

        match (status, &assigned_hub) {
            (ProvisioningStatus::Assigned, None) => {
                return Err(ProvisioningError::Malformed(
                    "assigned registration without a hub".to_owned(),
                ));
            }
            (ProvisioningStatus::Assigned, Some(_)) => {}
            // never hand out an endpoint for a registration that was not assigned
            (_, _) => {
                return Ok(ProvisioningResult {
                    status,
                    assigned_hub: None,
                    device_id: None,
                    error_message: state.and_then(|s| s.error_message.clone()),
                });
            }
        }

        Ok(ProvisioningResult {
            status,
            assigned_hub,
            device_id: state.and_then(|s| s.device_id.clone()),
            error_message: None,
        })
    }
}

/// An assigned identity, good for opening a channel to the hub.
///
/// The session is the only thing that survives provisioning.
#[derive(Clone, Debug)]
pub struct Session {
    endpoint: Uri,
    device_id: DeviceId,
    key: SymmetricKey,
}

impl Session {
    pub fn new(endpoint: Uri, device_id: DeviceId, key: SymmetricKey) -> Self {
        Self {
            endpoint,
            device_id,
            key,
        }
    }

    /// Messaging endpoint the device was assigned to
    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }
}

/// Register the device with the provisioning service and return a session
/// bound to the assigned hub.
///
/// This is a one-shot handshake. Rejections and malformed responses are
/// returned as errors without retrying, it is up to the caller to decide
/// whether to try again. While the service reports the assignment as in
/// progress the operation status is queried until `config.deadline`.
#[instrument(
    name = "provision",
    skip_all,
    fields(registration_id = %credential.registration_id, hub = field::Empty),
    err
)]
pub async fn provision(
    credential: &DeviceCredential,
    config: &ProvisioningConfig,
) -> Result<Session, ProvisioningError> {
    let deadline = Instant::now() + config.deadline;
    let session = timeout_at(deadline, register(credential, config))
        .await
        .map_err(|_| ProvisioningError::Timeout(config.deadline))??;

    Span::current().record("hub", field::display(session.endpoint()));
    info!("device provisioned to {}", session.endpoint());
    Ok(session)
}

async fn register(
    credential: &DeviceCredential,
    config: &ProvisioningConfig,
) -> Result<Session, ProvisioningError> {
    let client = Client::new();
    let resource = format!(
        "{}/registrations/{}",
        credential.id_scope, credential.registration_id
    );
    let query = format!("api-version={}", config.api_version);
    let token = SasToken::sign_for(
        &credential.symmetric_key,
        &resource,
        Some("registration"),
        config.token_ttl,
    )?;

    let endpoint = Uri::from_parts(
        config.endpoint.clone(),
        &format!("/{resource}/register"),
        Some(&query),
    )?;

    debug!("calling remote");
    let response = client
        .put(endpoint.to_string())
        .header(AUTHORIZATION, token.header_value())
        .timeout(config.request_timeout)
        .json(&RegisterRequest {
            registration_id: credential.registration_id.as_str(),
        })
        .send()
        .await?;

    let (mut operation, mut wait) = read_operation(response).await?;
    loop {
        let result = ProvisioningResult::try_from(&operation)?;
        match result.status {
            ProvisioningStatus::Assigned => {
                // checked when converting the response
                let hub = result.assigned_hub.unwrap_or_default();
                let device_id = match result.device_id {
                    Some(device_id) => DeviceId::try_from(device_id)?,
                    None => credential.registration_id.clone(),
                };
                let endpoint = Uri::from_host(&hub)?;
                return Ok(Session::new(
                    endpoint,
                    device_id,
                    credential.symmetric_key.clone(),
                ));
            }
            ProvisioningStatus::Failed => {
                let reason = result
                    .error_message
                    .or(operation.status.clone())
                    .unwrap_or_else(|| "failed".to_owned());
                return Err(ProvisioningError::Rejected(reason));
            }
            ProvisioningStatus::Retrying => {
                let operation_id = operation.operation_id.clone().ok_or_else(|| {
                    ProvisioningError::Malformed("missing operation id".to_owned())
                })?;

                let delay = wait.unwrap_or(config.poll_interval);
                trace!("assignment in progress, checking again in {delay:?}");
                sleep(delay).await;

                let endpoint = Uri::from_parts(
                    config.endpoint.clone(),
                    &format!("/{resource}/operations/{operation_id}"),
                    Some(&query),
                )?;
                let response = client
                    .get(endpoint.to_string())
                    .header(AUTHORIZATION, token.header_value())
                    .timeout(config.request_timeout)
                    .send()
                    .await?;

                (operation, wait) = read_operation(response).await?;
            }
        }
    }
}

async fn read_operation(
    response: Response,
) -> Result<(RegistrationOperation, Option<Duration>), ProvisioningError> {
    let status = response.status();
    if !status.is_success() {
        let err_msg = response.text().await.unwrap_or_default();
        return Err(ProvisioningError::Status(status, err_msg));
    }
    debug!(response = field::display(status), "success");

    let wait = retry_after(response.headers());
    let body = response.bytes().await?;
    let operation = serde_json::from_slice(&body)
        .map_err(|e| ProvisioningError::Malformed(e.to_string()))?;
    Ok((operation, wait))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::net::TcpListener;

    const REGISTER_PATH: &str = "/0ne00TEST/registrations/device-1/register";
    const OPERATION_PATH: &str = "/0ne00TEST/registrations/device-1/operations/op-1";

    fn credential() -> DeviceCredential {
        DeviceCredential {
            id_scope: "0ne00TEST".parse().unwrap(),
            registration_id: "device-1".parse().unwrap(),
            // base64("pomona-test-key-0123456789")
            symmetric_key: "cG9tb25hLXRlc3Qta2V5LTAxMjM0NTY3ODk=".parse().unwrap(),
        }
    }

    fn test_config(endpoint: String) -> ProvisioningConfig {
        ProvisioningConfig {
            endpoint: endpoint.parse().unwrap(),
            request_timeout: Duration::from_secs(5),
            deadline: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn api_version() -> Matcher {
        Matcher::UrlEncoded("api-version".into(), "2021-06-01".into())
    }

    #[tokio::test]
    async fn test_returns_session_bound_to_assigned_hub() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("PUT", REGISTER_PATH)
            .match_query(api_version())
            .match_header(
                "authorization",
                Matcher::Regex(
                    r"^SharedAccessSignature sr=0ne00TEST%2Fregistrations%2Fdevice-1&sig=.+&se=\d+&skn=registration$"
                        .to_owned(),
                ),
            )
            .match_body(Matcher::Json(json!({"registrationId": "device-1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "operationId": "op-1",
                    "status": "assigned",
                    "registrationState": {
                        "registrationId": "device-1",
                        "assignedHub": "my-hub.azure-devices.net",
                        "deviceId": "device-1",
                        "status": "assigned"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let session = provision(&credential(), &test_config(server.url()))
            .await
            .unwrap();

        assert_eq!(
            session.endpoint().to_string(),
            "https://my-hub.azure-devices.net/"
        );
        assert_eq!(session.device_id().as_str(), "device-1");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_waits_for_assignment_in_progress() {
        let mut server = Server::new_async().await;

        let register = server
            .mock("PUT", REGISTER_PATH)
            .match_query(api_version())
            .with_status(202)
            .with_header("retry-after", "0")
            .with_body(json!({"operationId": "op-1", "status": "assigning"}).to_string())
            .create_async()
            .await;

        let pending = server
            .mock("GET", OPERATION_PATH)
            .match_query(api_version())
            .with_status(202)
            .with_body(json!({"operationId": "op-1", "status": "assigning"}).to_string())
            .expect(1)
            .create_async()
            .await;

        let assigned = server
            .mock("GET", OPERATION_PATH)
            .match_query(api_version())
            .with_status(200)
            .with_body(
                json!({
                    "operationId": "op-1",
                    "status": "assigned",
                    "registrationState": {
                        "assignedHub": "other-hub.azure-devices.net",
                        "deviceId": "device-1",
                        "status": "assigned"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let session = provision(&credential(), &test_config(server.url()))
            .await
            .unwrap();

        assert_eq!(session.endpoint().host(), Some("other-hub.azure-devices.net"));

        register.assert_async().await;
        pending.assert_async().await;
        assigned.assert_async().await;
    }

    #[tokio::test]
    async fn test_fails_on_rejected_registration() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("PUT", REGISTER_PATH)
            .match_query(api_version())
            .with_status(200)
            .with_body(
                json!({
                    "operationId": "op-1",
                    "status": "failed",
                    "registrationState": {
                        "status": "failed",
                        "errorMessage": "enrollment not found"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let res = provision(&credential(), &test_config(server.url())).await;

        match res {
            Err(ProvisioningError::Rejected(reason)) => {
                assert_eq!(reason, "enrollment not found")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fails_on_disabled_registration() {
        let mut server = Server::new_async().await;

        server
            .mock("PUT", REGISTER_PATH)
            .match_query(api_version())
            .with_status(200)
            .with_body(json!({"operationId": "op-1", "status": "disabled"}).to_string())
            .create_async()
            .await;

        let res = provision(&credential(), &test_config(server.url())).await;
        assert!(matches!(res, Err(ProvisioningError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_fails_on_assignment_without_hub() {
        let mut server = Server::new_async().await;

        server
            .mock("PUT", REGISTER_PATH)
            .match_query(api_version())
            .with_status(200)
            .with_body(
                json!({
                    "operationId": "op-1",
                    "status": "assigned",
                    "registrationState": {"status": "assigned"}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let res = provision(&credential(), &test_config(server.url())).await;
        assert!(matches!(res, Err(ProvisioningError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_fails_on_malformed_response() {
        let mut server = Server::new_async().await;

        server
            .mock("PUT", REGISTER_PATH)
            .match_query(api_version())
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let res = provision(&credential(), &test_config(server.url())).await;
        assert!(matches!(res, Err(ProvisioningError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_fails_on_unknown_status() {
        let mut server = Server::new_async().await;

        server
            .mock("PUT", REGISTER_PATH)
            .match_query(api_version())
            .with_status(200)
            .with_body(json!({"operationId": "op-1", "status": "exploded"}).to_string())
            .create_async()
            .await;

        let res = provision(&credential(), &test_config(server.url())).await;
        assert!(matches!(res, Err(ProvisioningError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_fails_on_error_status() {
        let mut server = Server::new_async().await;

        server
            .mock("PUT", REGISTER_PATH)
            .match_query(api_version())
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let res = provision(&credential(), &test_config(server.url())).await;

        match res {
            Err(ProvisioningError::Status(status, body)) => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, "unauthorized");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fails_immediately_on_unassigned_registration() {
        let mut server = Server::new_async().await;

        let register = server
            .mock("PUT", REGISTER_PATH)
            .match_query(api_version())
            .with_status(200)
            .with_body(json!({"operationId": "op-1", "status": "unassigned"}).to_string())
            .expect(1)
            .create_async()
            .await;

        let operation = server
            .mock("GET", OPERATION_PATH)
            .match_query(api_version())
            .expect(0)
            .create_async()
            .await;

        let start = std::time::Instant::now();
        let res = provision(&credential(), &test_config(server.url())).await;

        assert!(matches!(res, Err(ProvisioningError::Rejected(_))));
        assert!(start.elapsed() < Duration::from_secs(2));
        register.assert_async().await;
        operation.assert_async().await;
    }

    #[tokio::test]
    async fn test_request_timeouts_are_reported() {
        // accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = ProvisioningConfig {
            request_timeout: Duration::from_millis(100),
            deadline: Duration::from_secs(5),
            ..test_config(format!("http://{addr}"))
        };
        let res = provision(&credential(), &config).await;

        assert!(matches!(res, Err(ProvisioningError::Request(e)) if e.is_timeout()));
    }

    #[tokio::test]
    async fn test_gives_up_after_deadline() {
        let mut server = Server::new_async().await;

        server
            .mock("PUT", REGISTER_PATH)
            .match_query(api_version())
            .with_status(202)
            .with_body(json!({"operationId": "op-1", "status": "assigning"}).to_string())
            .create_async()
            .await;

        server
            .mock("GET", OPERATION_PATH)
            .match_query(api_version())
            .with_status(202)
            .with_body(json!({"operationId": "op-1", "status": "assigning"}).to_string())
            .expect_at_least(1)
            .create_async()
            .await;

        let config = ProvisioningConfig {
            deadline: Duration::from_millis(200),
            ..test_config(server.url())
        };
        let res = provision(&credential(), &config).await;

        assert!(matches!(res, Err(ProvisioningError::Timeout(_))));
    }

    #[test]
    fn test_maps_registry_statuses() {
        let operation = |status: &str| RegistrationOperation {
            operation_id: Some("op-1".to_owned()),
            status: Some(status.to_owned()),
            registration_state: None,
        };

        assert_eq!(
            ProvisioningResult::try_from(&operation("assigning"))
                .unwrap()
                .status,
            ProvisioningStatus::Retrying
        );
        assert_eq!(
            ProvisioningResult::try_from(&operation("unassigned"))
                .unwrap()
                .status,
            ProvisioningStatus::Failed
        );
        assert_eq!(
            ProvisioningResult::try_from(&operation("failed"))
                .unwrap()
                .status,
            ProvisioningStatus::Failed
        );
    }

    #[test]
    fn test_never_reports_a_hub_unless_assigned() {
        let operation = RegistrationOperation {
            operation_id: None,
            status: Some("failed".to_owned()),
            registration_state: Some(RegistrationState {
                assigned_hub: Some("stale-hub".to_owned()),
                device_id: None,
                status: Some("failed".to_owned()),
                error_message: None,
            }),
        };

        let result = ProvisioningResult::try_from(&operation).unwrap();
        assert_eq!(result.assigned_hub, None);
    }
}
