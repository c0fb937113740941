//! Deployment polling, artifact fetching, and status reporting.

use std::time::Duration;

use reportify::{bail, Report, ResultExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::api::{
    api_deployments_log, api_deployments_status, api_error, classify_transport_error,
    ApiClient, ApiRequest, UpdateInfo, API_DEPLOYMENTS_NEXT,
};
use crate::resumer::{ResumedStream, UpdateResumer};
use crate::{ClientError, ClientResult};

/// Maximum time between download resume attempts.
const FETCH_MAX_WAIT: Duration = Duration::from_secs(60);

/// Status of a deployment as reported to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    /// The device is transferring the artifact.
    Downloading,
    /// The device is writing the artifact to storage.
    Installing,
    Rebooting,
    Success,
    Failure,
    AlreadyInstalled,
}

/// A status report for a deployment.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub substate: Option<String>,
}

impl StatusReport {
    pub fn new(status: DeploymentStatus) -> Self {
        Self {
            status,
            substate: None,
        }
    }

    pub fn with_substate(mut self, substate: impl Into<String>) -> Self {
        self.substate = Some(substate.into());
        self
    }
}

/// A deployment log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

impl LogMessage {
    pub fn new(level: &str, message: impl Into<String>) -> Self {
        Self {
            level: level.to_owned(),
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Instructions for a pending deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentInstructions {
    #[serde(rename = "id")]
    pub deployment_id: String,
    pub artifact: Artifact,
}

/// The artifact of a deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    pub artifact_name: String,
    #[serde(rename = "device_types_compatible")]
    pub device_types: Vec<String>,
    pub source: ArtifactSource,
}

/// Where to fetch the artifact from.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactSource {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub expire: Option<String>,
}

impl DeploymentInstructions {
    /// Check that the deployment is applicable to this device.
    pub fn validate(&self, info: &UpdateInfo) -> ClientResult<()> {
        if !self
            .artifact
            .device_types
            .iter()
            .any(|device_type| device_type == &info.device_type)
        {
            bail!(
                "invalid deployment instructions: device type not satisfied: {} not in {:?}",
                info.device_type,
                self.artifact.device_types
            );
        }
        if self.artifact.artifact_name == info.artifact_name {
            return Err(Report::new(ClientError::AlreadyInstalled));
        }
        Ok(())
    }
}

/// Parse a `Content-Range: bytes <first>-<last>/<size>` header.
///
/// The server must extend the range to the end of the artifact, so
/// `last + 1 == size` is required.
fn parse_content_range(header: &str) -> Option<(u64, u64, u64)> {
    let rest = header.trim().strip_prefix("bytes")?.trim_start();
    let (range, size) = rest.split_once('/')?;
    let (first, last) = range.split_once('-')?;
    let first: u64 = first.trim().parse().ok()?;
    let last: u64 = last.trim().parse().ok()?;
    let size: u64 = size.trim().parse().ok()?;
    if size == 0 || last + 1 != size || last < first {
        return None;
    }
    Some((first, last, size))
}

impl ApiClient {
    /// Check whether a deployment is pending for this device.
    ///
    /// Returns `None` when no update is scheduled. A deployment matching
    /// the installed artifact is reported as already installed to the
    /// server and surfaced as [`ClientError::AlreadyInstalled`].
    pub fn check_update(&mut self) -> ClientResult<Option<DeploymentInstructions>> {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("artifact_name", &self.update_info().artifact_name)
            .append_pair("device_type", &self.update_info().device_type)
            .finish();
        let response = self.send(&ApiRequest::get(format!("{API_DEPLOYMENTS_NEXT}?{query}")))?;
        match response.status().as_u16() {
            204 => Ok(None),
            200 => {
                let body = response
                    .into_body()
                    .read_to_string()
                    .whatever("unable to read deployment instructions")?;
                let instructions: DeploymentInstructions = serde_json::from_str(&body)
                    .whatever("unable to parse deployment instructions")?;
                if let Err(report) = instructions.validate(self.update_info()) {
                    if matches!(report.error(), ClientError::AlreadyInstalled) {
                        self.update_status(
                            &instructions.deployment_id,
                            StatusReport::new(DeploymentStatus::AlreadyInstalled),
                        )?;
                    }
                    return Err(report);
                }
                Ok(Some(instructions))
            }
            _ => Err(api_error(response)),
        }
    }

    /// Fetch the artifact of a deployment as a resumable stream.
    ///
    /// Returns `None` when the instructions carry no URL, which is not an
    /// error per the API contract.
    pub fn fetch_update(
        &mut self,
        instructions: &DeploymentInstructions,
    ) -> ClientResult<Option<UpdateResumer>> {
        let source = &instructions.artifact.source;
        if let Some(expire) = &source.expire {
            match chrono::DateTime::parse_from_rfc3339(expire) {
                Err(error) => warn!("unable to check update link expiry date: {error}"),
                Ok(expire) => {
                    if expire.with_timezone(&chrono::Utc) < chrono::Utc::now() {
                        error!("the update URL has already expired");
                        return Err(Report::new(ClientError::UrlExpired));
                    }
                }
            }
        }
        let Some(url) = source.url.clone().filter(|url| !url.is_empty()) else {
            info!("update instructions do not contain a URL");
            return Ok(None);
        };

        let response = self
            .agent()
            .get(&url)
            .call()
            .map_err(classify_transport_error)?;
        if response.status().as_u16() != 200 {
            return Err(api_error(response));
        }
        let content_length: u64 = response
            .headers()
            .get("Content-Length")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| {
                reportify::whatever("artifact server did not provide a content length")
            })?;

        let agent = self.agent().clone();
        let resume = Box::new(move |offset: u64| -> ClientResult<ResumedStream> {
            let response = agent
                .get(&url)
                .header("Range", &format!("bytes={offset}-"))
                .call()
                .map_err(classify_transport_error)?;
            if offset > 0 && response.status().as_u16() != 206 {
                bail!(
                    "could not resume download from offset {offset} (HTTP status {})",
                    response.status()
                );
            }
            let header = response
                .headers()
                .get("Content-Range")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            debug!("Content-Range received from server: {header:?}");
            let Some((first, _, size)) = parse_content_range(&header) else {
                bail!("malformed Content-Range received from server: {header:?}");
            };
            Ok(ResumedStream {
                body: Box::new(response.into_body().into_reader()),
                first_byte: first,
                total_size: size,
            })
        });
        Ok(Some(UpdateResumer::new(
            Box::new(response.into_body().into_reader()),
            content_length,
            FETCH_MAX_WAIT,
            resume,
        )))
    }

    /// Report the status of a deployment.
    pub fn update_status(&mut self, deployment_id: &str, report: StatusReport) -> ClientResult<()> {
        let body = serde_json::to_value(&report).whatever("unable to serialize status report")?;
        let response = self.send(&ApiRequest::put_json(
            api_deployments_status(deployment_id),
            body,
        ))?;
        match response.status().as_u16() {
            204 => {
                debug!("status {:?} reported", report.status);
                Ok(())
            }
            409 => {
                warn!("status report rejected, deployment aborted at the backend");
                Err(Report::new(ClientError::DeploymentAborted))
            }
            status => {
                error!("got unexpected HTTP status when reporting status: {status}");
                Err(api_error(response))
            }
        }
    }

    /// Push deployment logs to the server.
    pub fn log(&mut self, deployment_id: &str, messages: &[LogMessage]) -> ClientResult<()> {
        if self.servers()[self.active_server()].api_token().is_none() {
            self.authorize()?;
        }
        let body = serde_json::to_value(messages).whatever("unable to serialize log messages")?;
        let response = self.send(&ApiRequest::put_json(
            api_deployments_log(deployment_id),
            body,
        ))?;
        match response.status().as_u16() {
            204 => Ok(()),
            _ => Err(api_error(response)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use crate::api::tests::{spawn_fixture_server, test_client, CannedResponse};

    use super::*;

    fn instructions_json(artifact_name: &str, device_type: &str) -> String {
        format!(
            r#"{{
                "id": "dep-1",
                "artifact": {{
                    "artifact_name": "{artifact_name}",
                    "device_types_compatible": ["{device_type}"],
                    "source": {{"url": "", "expire": ""}}
                }}
            }}"#
        )
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 500-999/1000"),
            Some((500, 999, 1000))
        );
        assert_eq!(parse_content_range(" bytes 0-9/10 "), Some((0, 9, 10)));
        // Range must extend to the end of the artifact.
        assert_eq!(parse_content_range("bytes 500-998/1000"), None);
        assert_eq!(parse_content_range("bytes 900-800/1000"), None);
        assert_eq!(parse_content_range("bytes */1000"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn test_check_update_no_deployment() {
        let (url, requests) = spawn_fixture_server(vec![CannedResponse::new(204)]);
        let (mut client, _dir) = test_client(&url);
        assert!(client.check_update().unwrap().is_none());
        let requests = requests.lock().unwrap();
        assert!(requests[0].path.contains("artifact_name=release-1"));
        assert!(requests[0].path.contains("device_type=rpi3"));
    }

    #[test]
    fn test_check_update_pending_deployment() {
        let (url, _requests) = spawn_fixture_server(vec![CannedResponse::new(200)
            .with_body(instructions_json("release-2", "rpi3").as_bytes())]);
        let (mut client, _dir) = test_client(&url);
        let instructions = client.check_update().unwrap().unwrap();
        assert_eq!(instructions.deployment_id, "dep-1");
        assert_eq!(instructions.artifact.artifact_name, "release-2");
    }

    #[test]
    fn test_check_update_already_installed() {
        // The installed artifact is offered again: the client reports
        // `already-installed` and surfaces the sentinel error.
        let (url, requests) = spawn_fixture_server(vec![
            CannedResponse::new(200).with_body(instructions_json("release-1", "rpi3").as_bytes()),
            CannedResponse::new(204),
        ]);
        let (mut client, _dir) = test_client(&url);
        let report = client.check_update().unwrap_err();
        assert!(matches!(report.error(), ClientError::AlreadyInstalled));

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].method, "PUT");
        assert!(requests[1].path.ends_with("/deployments/dep-1/status"));
        let body: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
        assert_eq!(body["status"], "already-installed");
        assert!(body.get("substate").is_none());
    }

    #[test]
    fn test_check_update_incompatible_device_type() {
        let (url, _requests) = spawn_fixture_server(vec![CannedResponse::new(200)
            .with_body(instructions_json("release-2", "rpi4").as_bytes())]);
        let (mut client, _dir) = test_client(&url);
        let report = client.check_update().unwrap_err();
        assert!(!matches!(report.error(), ClientError::AlreadyInstalled));
    }

    #[test]
    fn test_update_status_aborted() {
        let (url, _requests) = spawn_fixture_server(vec![CannedResponse::new(409)]);
        let (mut client, _dir) = test_client(&url);
        let report = client
            .update_status("dep-1", StatusReport::new(DeploymentStatus::Installing))
            .unwrap_err();
        assert!(matches!(report.error(), ClientError::DeploymentAborted));
    }

    #[test]
    fn test_update_status_with_substate() {
        let (url, requests) = spawn_fixture_server(vec![CannedResponse::new(204)]);
        let (mut client, _dir) = test_client(&url);
        client
            .update_status(
                "dep-1",
                StatusReport::new(DeploymentStatus::Downloading).with_substate("$progress=12.50,"),
            )
            .unwrap();
        let requests = requests.lock().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["status"], "downloading");
        assert_eq!(body["substate"], "$progress=12.50,");
    }

    #[test]
    fn test_fetch_update_expired_url() {
        let (mut client, _dir) = test_client("http://127.0.0.1:1");
        let instructions: DeploymentInstructions = serde_json::from_str(
            r#"{
                "id": "dep-1",
                "artifact": {
                    "artifact_name": "release-2",
                    "device_types_compatible": ["rpi3"],
                    "source": {
                        "url": "http://storage.example.org/artifact",
                        "expire": "2017-01-01T00:00:00Z"
                    }
                }
            }"#,
        )
        .unwrap();
        let report = client.fetch_update(&instructions).unwrap_err();
        assert!(matches!(report.error(), ClientError::UrlExpired));
    }

    #[test]
    fn test_fetch_update_without_url() {
        let (mut client, _dir) = test_client("http://127.0.0.1:1");
        let instructions: DeploymentInstructions =
            serde_json::from_str(&instructions_json("release-2", "rpi3")).unwrap();
        assert!(client.fetch_update(&instructions).unwrap().is_none());
    }

    #[test]
    fn test_fetch_update_streams_body() {
        let (url, requests) = spawn_fixture_server(vec![
            CannedResponse::new(200).with_body(b"firmware-image")
        ]);
        let (mut client, _dir) = test_client("http://127.0.0.1:1");
        let instructions: DeploymentInstructions = serde_json::from_str(&format!(
            r#"{{
                "id": "dep-1",
                "artifact": {{
                    "artifact_name": "release-2",
                    "device_types_compatible": ["rpi3"],
                    "source": {{"url": "{url}/artifact"}}
                }}
            }}"#
        ))
        .unwrap();
        let mut stream = client.fetch_update(&instructions).unwrap().unwrap();
        assert_eq!(stream.content_length(), 14);
        let mut body = Vec::new();
        stream.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"firmware-image");
        // The fetch is unauthenticated, it goes straight to the signed URL.
        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].path, "/artifact");
        assert_eq!(requests[0].header("Authorization"), None);
    }
}
