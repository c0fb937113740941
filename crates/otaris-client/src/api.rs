//! Multi-server device API dispatch.
//!
//! The client can be configured with multiple servers for redundancy or
//! migration. Requests are dispatched starting at the active server; a
//! `401` triggers exactly one re-authentication attempt against that
//! server before falling through to the next one. Transport errors short
//! circuit instead of falling through, preserving the idempotence
//! contract of status reports.

use std::fs;
use std::time::Duration;

use base64::Engine;
use reportify::{bail, Report, ResultExt};
use serde::Deserialize;
use tracing::{error, info, warn};
use ureq::http::Response;
use ureq::tls::{Certificate, RootCerts, TlsConfig};
use ureq::{Agent, Body};

use crate::auth::AuthManager;
use crate::{ClientError, ClientResult, TransportErrorKind};

/// Deployments endpoint for the next pending deployment.
pub const API_DEPLOYMENTS_NEXT: &str = "/api/v1/deployments/device/deployments/next";
/// Inventory endpoint.
pub const API_INVENTORY: &str = "/api/devices/v1/inventory";
/// Authentication endpoint.
pub const API_AUTH: &str = "/api/devices/v1/authentication";

/// Status endpoint for a deployment.
pub fn api_deployments_status(deployment_id: &str) -> String {
    format!("/api/v1/deployments/device/deployments/{deployment_id}/status")
}

/// Log endpoint for a deployment.
pub fn api_deployments_log(deployment_id: &str) -> String {
    format!("/api/v1/deployments/device/deployments/{deployment_id}/log")
}

/// Total request timeout, covering everything from dial to the last body
/// byte. Four hours are enough to download a 2 GiB image at roughly
/// 1 Mbit/s.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// A management server the client can talk to.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    /// Server URL, immutable after configuration.
    pub url: String,
    /// Static tenant token for multi-tenant servers, immutable.
    pub tenant_token: String,
    /// Bearer token issued by the server, written only by the auth path.
    pub(crate) api_token: Option<Vec<u8>>,
}

impl ServerDescriptor {
    pub fn new(url: impl Into<String>, tenant_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tenant_token: tenant_token.into(),
            api_token: None,
        }
    }

    /// The cached bearer token, if any.
    pub fn api_token(&self) -> Option<&[u8]> {
        self.api_token.as_deref()
    }
}

/// The device's current installation state used to match deployments.
#[derive(Debug, Clone)]
pub struct UpdateInfo {
    pub device_type: String,
    pub artifact_name: String,
}

/// TLS options of the HTTP transport.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Self-signed server certificate appended to the trust roots.
    pub server_cert: Option<std::path::PathBuf>,
    /// Skip certificate verification; development only.
    pub skip_verify: bool,
}

/// HTTP method of an [`ApiRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Put,
    Patch,
}

/// A server-relative request handled by the dispatcher.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    /// Path including any query string.
    path: String,
    body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn put_json(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Put,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn patch_json(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Patch,
            path: path.into(),
            body: Some(body),
        }
    }
}

/// Client for the device API of one or more management servers.
pub struct ApiClient {
    agent: Agent,
    servers: Vec<ServerDescriptor>,
    active_server: usize,
    update_info: UpdateInfo,
    auth: AuthManager,
}

impl ApiClient {
    /// Create a new client towards the given servers.
    ///
    /// Cached tokens are loaded from the auth manager's store so that a
    /// restart does not force a re-authentication.
    pub fn new(
        mut servers: Vec<ServerDescriptor>,
        update_info: UpdateInfo,
        auth: AuthManager,
        tls: &TlsOptions,
    ) -> ClientResult<Self> {
        if servers.is_empty() {
            bail!("at least one server must be configured");
        }
        for server in &mut servers {
            server.api_token = auth.auth_token(server)?;
        }
        Ok(Self {
            agent: build_agent(tls)?,
            servers,
            active_server: 0,
            update_info,
            auth,
        })
    }

    /// The configured servers.
    pub fn servers(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    /// Index of the currently active server.
    pub fn active_server(&self) -> usize {
        self.active_server
    }

    /// The device's installation state.
    pub fn update_info(&self) -> &UpdateInfo {
        &self.update_info
    }

    /// The auth manager.
    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub(crate) fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Dispatch a request across the configured servers.
    ///
    /// Returns the first response with a status below `400`, or the last
    /// response seen. Transport errors are returned immediately; whether
    /// to retry is the caller's decision.
    pub fn send(&mut self, request: &ApiRequest) -> ClientResult<Response<Body>> {
        let count = self.servers.len();
        let mut last_response = None;
        for i in 0..count {
            let index = (self.active_server + i) % count;
            let response = self.execute_on(index, request)?;
            let status = response.status().as_u16();
            if status < 400 {
                return Ok(response);
            }
            if status != 401 {
                last_response = Some(response);
                continue;
            }
            info!(
                "client not authorized with {}; re-authorizing",
                self.servers[index].url
            );
            match self.authorize_server(index) {
                Err(report) => {
                    warn!("re-authorization failed: {report:?}");
                    last_response = Some(response);
                    continue;
                }
                Ok(()) => {
                    info!("successfully re-authorized");
                    self.active_server = index;
                    let retry = self.execute_on(index, request)?;
                    if retry.status().as_u16() < 400 {
                        return Ok(retry);
                    }
                    last_response = Some(retry);
                }
            }
        }
        // There is at least one server, so at least one response was seen.
        Ok(last_response.unwrap())
    }

    fn execute_on(&self, index: usize, request: &ApiRequest) -> ClientResult<Response<Body>> {
        let server = &self.servers[index];
        let url = format!("{}{}", server.url.trim_end_matches('/'), request.path);
        let bearer = format!(
            "Bearer {}",
            String::from_utf8_lossy(server.api_token.as_deref().unwrap_or_default())
        );
        let result = match (request.method, &request.body) {
            (Method::Get, _) => self
                .agent
                .get(&url)
                .header("Authorization", &bearer)
                .call(),
            (Method::Put, Some(body)) => self
                .agent
                .put(&url)
                .header("Authorization", &bearer)
                .header("Content-Type", "application/json")
                .send_json(body),
            (Method::Patch, Some(body)) => self
                .agent
                .patch(&url)
                .header("Authorization", &bearer)
                .header("Content-Type", "application/json")
                .send_json(body),
            _ => bail!("request without body for method {:?}", request.method),
        };
        result.map_err(classify_transport_error)
    }

    /// Authenticate against the active server, falling through the server
    /// list until one accepts the request.
    pub fn authorize(&mut self) -> ClientResult<()> {
        let count = self.servers.len();
        for i in 0..count {
            let index = (self.active_server + i) % count;
            match self.authorize_server(index) {
                Ok(()) => {
                    self.active_server = index;
                    return Ok(());
                }
                Err(report) => {
                    warn!(
                        "authorization with {} failed: {report:?}",
                        self.servers[index].url
                    );
                }
            }
        }
        Err(Report::new(ClientError::NotAuthorized))
    }

    /// Single authentication attempt against one server.
    fn authorize_server(&mut self, index: usize) -> ClientResult<()> {
        let server = &self.servers[index];
        let auth_request = self.auth.make_auth_request(server)?;
        let url = format!("{}{}", server.url.trim_end_matches('/'), API_AUTH);
        // Raw signature bytes are not a valid header value; the wire
        // carries the customary base64 rendering.
        let signature = base64::engine::general_purpose::STANDARD.encode(&auth_request.signature);
        let response = self
            .agent
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-MEN-Signature", &signature)
            .send(&auth_request.body[..])
            .map_err(classify_transport_error)?;
        if response.status().as_u16() != 200 {
            return Err(api_error(response));
        }
        let token = response
            .into_body()
            .read_to_vec()
            .whatever("unable to read auth response body")?;
        let server = &self.servers[index];
        self.auth.recv_auth_response(server, &token)?;
        self.servers[index].api_token = Some(token);
        Ok(())
    }
}

fn build_agent(tls: &TlsOptions) -> ClientResult<Agent> {
    let mut tls_config = TlsConfig::builder();
    if tls.skip_verify {
        warn!("certificate verification skipped");
        tls_config = tls_config.disable_verification(true);
    }
    if let Some(path) = &tls.server_cert {
        // The certificate backs the agent for the process lifetime.
        let pem: &'static [u8] = fs::read(path)
            .whatever("unable to read server certificate")
            .with_info(|_| format!("path: {path:?}"))?
            .leak();
        let certificate =
            Certificate::from_pem(pem).whatever("unable to parse server certificate")?;
        tls_config = tls_config.root_certs(RootCerts::new_with_certs(&[certificate]));
    }
    let config = Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(DEFAULT_REQUEST_TIMEOUT))
        .tls_config(tls_config.build())
        .build();
    Ok(config.new_agent())
}

/// Error body the server attaches to failed requests.
#[derive(Debug, Deserialize)]
struct ServerErrorBody {
    #[serde(default)]
    error: String,
}

/// Build an [`ClientError::Api`] report from a failed response.
pub(crate) fn api_error(response: Response<Body>) -> Report<ClientError> {
    let status = response.status().as_u16();
    let request_id = response
        .headers()
        .get("request_id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let server_message = response
        .into_body()
        .read_to_string()
        .ok()
        .and_then(|body| serde_json::from_str::<ServerErrorBody>(&body).ok())
        .map(|body| body.error)
        .unwrap_or_default();
    Report::new(ClientError::Api {
        status,
        request_id,
        server_message,
    })
}

/// Classify a transport failure, logging remediation hints for TLS
/// problems.
pub(crate) fn classify_transport_error(error: ureq::Error) -> Report<ClientError> {
    let chain = render_error_chain(&error);
    let kind = classify_tls_failure(&chain);
    match kind {
        TransportErrorKind::UnknownAuthority => {
            error!("certificate is signed by unknown authority");
            error!(
                "if you are using a self-signed certificate, make sure it is \
                 configured as the server certificate of the agent"
            );
        }
        TransportErrorKind::CertificateExpired => {
            error!("certificate has expired or is not yet valid");
            error!(
                "verify that the clock on the device is correct and that the \
                 certificate expiration date is valid"
            );
        }
        TransportErrorKind::CertificateInvalid => {
            error!("server certificate is invalid");
        }
        TransportErrorKind::Other => {}
    }
    let mut report = Report::new(ClientError::Transport(kind));
    report.add_info(format!("cause: {chain}"));
    report
}

fn render_error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Map a rendered transport error chain to a TLS failure kind.
///
/// The TLS stack does not expose structured certificate errors, so this
/// matches on the stable reason strings of its error rendering.
fn classify_tls_failure(chain: &str) -> TransportErrorKind {
    if chain.contains("UnknownIssuer") {
        TransportErrorKind::UnknownAuthority
    } else if chain.contains("Expired") {
        TransportErrorKind::CertificateExpired
    } else if chain.contains("InvalidCertificate") || chain.contains("invalid peer certificate") {
        TransportErrorKind::CertificateInvalid
    } else {
        TransportErrorKind::Other
    }
}
