//! Authenticated device API client of the Otaris update agent.
//!
//! The client speaks to one or more management servers: it authenticates
//! the device with a signed identity handshake, polls for pending
//! deployments, fetches artifacts over resumable streams, and reports
//! deployment status and logs. Requests are dispatched across the
//! configured servers with automatic re-authentication on `401`.

use reportify::Report;
use thiserror::Error;

pub mod api;
pub mod auth;
pub mod deployments;
pub mod identity;
pub mod inventory;
pub mod keystore;
pub mod resumer;

pub use api::{ApiClient, ServerDescriptor, TlsOptions, UpdateInfo};

/// Classified transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportErrorKind {
    #[error("certificate signed by unknown authority")]
    UnknownAuthority,
    #[error("certificate has expired or is not yet valid")]
    CertificateExpired,
    #[error("certificate exists, but is invalid")]
    CertificateInvalid,
    #[error("connection failed")]
    Other,
}

/// Errors surfaced by the device API client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No usable token and re-authentication failed.
    #[error("device not authorized")]
    NotAuthorized,
    /// The server answered a status report with `409`.
    #[error("deployment was aborted on the server")]
    DeploymentAborted,
    /// The offered artifact is already installed.
    #[error("artifact already installed")]
    AlreadyInstalled,
    /// The pre-signed artifact URL has expired.
    #[error("update URL expired")]
    UrlExpired,
    /// Any non-success HTTP status not mapped to a more specific error.
    #[error("API error (request_id: {request_id}, status: {status}): {server_message}")]
    Api {
        status: u16,
        request_id: String,
        server_message: String,
    },
    /// Low-level I/O or TLS failure.
    #[error("transport error: {0}")]
    Transport(TransportErrorKind),
    #[error("client error")]
    Other,
}

impl reportify::Whatever for ClientError {
    fn new() -> Self {
        ClientError::Other
    }
}

/// Result with a [`ClientError`] report.
pub type ClientResult<T> = Result<T, Report<ClientError>>;
