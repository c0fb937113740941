//! The install pipeline.
//!
//! Orchestrates a deployment from check to reboot: resolve the inactive
//! partition, stream the artifact (or apply it as a delta patch against
//! the active partition) through the bounded writer, flip the boot
//! variables, and report status to the server at every stage. After the
//! reboot, [`Installer::commit`] either confirms the update or rolls the
//! boot variables back.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byte_calc::NumBytes;
use reportify::{bail, Report, ResultExt};
use tracing::{error, info, warn};

use otaris_client::deployments::{
    DeploymentInstructions, DeploymentStatus, LogMessage, StatusReport,
};
use otaris_client::{ApiClient, ClientError};
use otaris_common::blockdev::PartitionDevice;
use otaris_common::cancel::CancelToken;
use otaris_common::delta::{apply_patch, DeltaError};
use otaris_common::store::Store;

use crate::progress::ProgressReporter;
use crate::system::{InstallError, InstallResult, System};

/// Store key of the deployment awaiting its post-reboot status report.
const DEPLOYMENT_ID_KEY: &str = "deployment-id";

/// Chunk size of the artifact pump.
const COPY_CHUNK_SIZE: usize = 32 * 1024;

/// Options of a single install run.
pub struct InstallOptions {
    /// Apply the artifact as a delta patch against the active partition.
    pub delta: bool,
    /// Size of the patched rootfs for delta installs; defaults to the
    /// capacity of the target partition.
    pub rootfs_size: Option<u64>,
    /// Client used by the background progress reporter.
    pub progress: Option<ApiClient>,
    pub progress_interval: Duration,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            delta: false,
            rootfs_size: None,
            progress: None,
            progress_interval: Duration::from_secs(30),
        }
    }
}

/// Outcome of a check-and-install cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// No deployment is pending.
    NoUpdate,
    /// The pending deployment matches the installed artifact.
    AlreadyInstalled,
    /// An update was written; a reboot activates it.
    Installed,
}

/// The update agent's install orchestration.
pub struct Installer {
    client: ApiClient,
    system: System,
    store: Store,
    cancel: CancelToken,
}

impl Installer {
    pub fn new(client: ApiClient, system: System, store: Store, cancel: CancelToken) -> Self {
        Self {
            client,
            system,
            store,
            cancel,
        }
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut System {
        &mut self.system
    }

    /// Poll for a deployment and install it if one is pending.
    pub fn check_and_install(&mut self, options: InstallOptions) -> InstallResult<InstallOutcome> {
        let instructions = match self.client.check_update() {
            Ok(Some(instructions)) => instructions,
            Ok(None) => {
                info!("no update available");
                return Ok(InstallOutcome::NoUpdate);
            }
            Err(report) => {
                if matches!(report.error(), ClientError::AlreadyInstalled) {
                    info!("deployment matches the installed artifact");
                    return Ok(InstallOutcome::AlreadyInstalled);
                }
                return Err(report).propagate();
            }
        };
        info!(
            "installing deployment {} ({})",
            instructions.deployment_id, instructions.artifact.artifact_name
        );
        self.install_deployment(&instructions, options)?;
        Ok(InstallOutcome::Installed)
    }

    /// Install a deployment, reporting failure to the server on any error.
    pub fn install_deployment(
        &mut self,
        instructions: &DeploymentInstructions,
        options: InstallOptions,
    ) -> InstallResult<()> {
        let deployment_id = instructions.deployment_id.clone();
        match self.run_pipeline(&deployment_id, instructions, options) {
            Ok(()) => Ok(()),
            Err(report) => {
                if matches!(report.error(), InstallError::Aborted) {
                    // The server aborted the deployment; it neither expects
                    // a failure report nor was the boot environment touched.
                    return Err(report);
                }
                error!("installation failed: {report:?}");
                if let Err(env_error) = self.system.write_rollback() {
                    warn!("unable to write rollback boot environment: {env_error:?}");
                }
                let logs = [LogMessage::new(
                    "error",
                    format!("update failed: {}", report.error()),
                )];
                if let Err(log_error) = self.client.log(&deployment_id, &logs) {
                    warn!("unable to push deployment logs: {log_error:?}");
                }
                let mut failure = StatusReport::new(DeploymentStatus::Failure);
                if matches!(report.error(), InstallError::Cancelled) {
                    failure = failure.with_substate("cancelled");
                }
                if let Err(status_error) = self.client.update_status(&deployment_id, failure) {
                    warn!("unable to report deployment failure: {status_error:?}");
                }
                Err(report)
            }
        }
    }

    fn run_pipeline(
        &mut self,
        deployment_id: &str,
        instructions: &DeploymentInstructions,
        options: InstallOptions,
    ) -> InstallResult<()> {
        self.client
            .update_status(deployment_id, StatusReport::new(DeploymentStatus::Downloading))
            .propagate()?;
        let Some(mut stream) = self.client.fetch_update(instructions).propagate()? else {
            bail!(
                "deployment {deployment_id} does not provide an artifact URL"
            );
        };
        let artifact_size = stream.content_length();
        info!("fetching artifact of size {}", NumBytes::new(artifact_size));

        self.client
            .update_status(deployment_id, StatusReport::new(DeploymentStatus::Installing))
            .propagate()?;

        let written = Arc::new(AtomicU64::new(0));
        let reporter = options.progress.map(|client| {
            ProgressReporter::spawn(
                client,
                deployment_id.to_owned(),
                DeploymentStatus::Installing,
                written.clone(),
                artifact_size,
                options.progress_interval,
                self.cancel.clone(),
            )
        });
        let result = if options.delta {
            self.write_delta(&mut stream, options.rootfs_size, &written)
        } else {
            self.write_image(&mut stream, artifact_size, &written)
        };
        if let Some(reporter) = reporter {
            reporter.finish();
        }
        result?;

        self.store
            .write(DEPLOYMENT_ID_KEY, deployment_id.as_bytes())
            .whatever("unable to persist deployment id")?;
        self.system.enable_updated_partition()?;
        Ok(())
    }

    /// Stream a full rootfs image to the inactive partition.
    fn write_image(
        &mut self,
        image: &mut dyn Read,
        size: u64,
        written: &AtomicU64,
    ) -> InstallResult<()> {
        if size == 0 {
            bail!("have invalid update of size 0, aborting");
        }
        let inactive = self.system.inactive_partition()?.to_owned();
        let mut device = PartitionDevice::new(Path::new(&inactive), size);
        self.check_capacity(&device, size)?;

        let result = pump(image, &mut device, &self.cancel, written);
        match result {
            Ok(copied) => {
                info!(
                    "wrote {}/{} bytes of update to device {:?}",
                    copied,
                    size,
                    device.path()
                );
                device
                    .close()
                    .map_err(|error| self.map_io_error(error))
            }
            Err(error) => {
                let _ = device.close();
                Err(self.map_io_error(error))
            }
        }
    }

    /// Apply a delta patch, streaming the active partition as the source
    /// and the inactive partition as the target.
    fn write_delta(
        &mut self,
        patch: &mut dyn Read,
        rootfs_size: Option<u64>,
        written: &AtomicU64,
    ) -> InstallResult<()> {
        let inactive = self.system.inactive_partition()?.to_owned();
        let active = self.system.active_partition()?.to_owned();

        let probe = PartitionDevice::new(Path::new(&inactive), 0);
        let capacity = probe
            .size()
            .whatever("unable to read size of target block device")
            .with_info(|_| format!("device: {inactive:?}"))?;
        let size = rootfs_size.unwrap_or(capacity);
        info!("preparing to install delta update of size {}", NumBytes::new(size));

        let mut target = PartitionDevice::new(Path::new(&inactive), size);
        self.check_capacity(&target, size)?;
        let source = PartitionDevice::new(Path::new(&active), 0);

        let patch = CancellableReader {
            inner: patch,
            cancel: &self.cancel,
        };
        let result = apply_patch(
            patch,
            source,
            CountingWriter {
                inner: &mut target,
                written,
            },
        );
        match result {
            Ok(decoded) => {
                info!(
                    "wrote {} bytes of patched rootfs to device {:?}",
                    decoded,
                    target.path()
                );
                target
                    .close()
                    .map_err(|error| self.map_io_error(error))
            }
            Err(error) => {
                let _ = target.close();
                error!("delta update decoding failed: {error}");
                Err(self.map_delta_error(error))
            }
        }
    }

    /// Check that an image of `size` bytes fits the target device.
    fn check_capacity(&self, device: &PartitionDevice, size: u64) -> InstallResult<()> {
        let capacity = device
            .size()
            .whatever("unable to read size of target block device")
            .with_info(|_| format!("device: {:?}", device.path()))?;
        validate_capacity(device.is_ubi(), capacity, size)
            .with_info(|_| format!("device: {:?}", device.path()))
    }

    fn map_io_error(&self, error: io::Error) -> Report<InstallError> {
        if self.cancel.is_cancelled() {
            return Report::new(InstallError::Cancelled);
        }
        if error.raw_os_error() == Some(nix::libc::ENOSPC) {
            return Report::new(InstallError::OutOfSpace);
        }
        let mut report = Report::new(InstallError::Fatal);
        report.add_info(format!("cause: {error}"));
        report
    }

    fn map_delta_error(&self, error: DeltaError) -> Report<InstallError> {
        match error {
            DeltaError::Io(error) => self.map_io_error(error),
            other => {
                let mut report = Report::new(InstallError::Fatal);
                report.add_info(format!("cause: {other}"));
                report
            }
        }
    }

    /// Confirm or roll back a freshly booted update.
    ///
    /// With `upgrade_available` set, either the device booted from the
    /// enabled partition (commit, report success) or the bootloader fell
    /// back to the old one (write rollback, report failure).
    pub fn commit(&mut self) -> InstallResult<()> {
        let deployment_id = self
            .store
            .read(DEPLOYMENT_ID_KEY)
            .whatever("unable to read pending deployment id")?
            .map(|id| String::from_utf8_lossy(&id).into_owned());
        if !self.system.has_update()? {
            return Err(Report::new(InstallError::NothingToCommit));
        }
        if self.system.booted_from_enabled()? {
            self.system.commit_update()?;
            info!("update committed");
            if let Some(deployment_id) = &deployment_id {
                if let Err(report) = self
                    .client
                    .update_status(deployment_id, StatusReport::new(DeploymentStatus::Success))
                {
                    warn!("unable to report deployment success: {report:?}");
                }
            }
            self.store
                .remove(DEPLOYMENT_ID_KEY)
                .whatever("unable to clear pending deployment id")?;
            Ok(())
        } else {
            warn!("device booted back to the old partition, rolling back");
            self.system.write_rollback()?;
            if let Some(deployment_id) = &deployment_id {
                let logs = [LogMessage::new(
                    "error",
                    "bootloader fell back to the previous partition",
                )];
                if let Err(report) = self.client.log(deployment_id, &logs) {
                    warn!("unable to push deployment logs: {report:?}");
                }
                if let Err(report) = self
                    .client
                    .update_status(deployment_id, StatusReport::new(DeploymentStatus::Failure))
                {
                    warn!("unable to report deployment failure: {report:?}");
                }
            }
            self.store
                .remove(DEPLOYMENT_ID_KEY)
                .whatever("unable to clear pending deployment id")?;
            bail!("update failed, bootloader fell back to the previous partition")
        }
    }

    /// Report the rebooting status and reboot into the new partition.
    pub fn reboot_into_update(&mut self) -> InstallResult<()> {
        if let Ok(Some(deployment_id)) = self.store.read(DEPLOYMENT_ID_KEY) {
            let deployment_id = String::from_utf8_lossy(&deployment_id).into_owned();
            if let Err(report) = self
                .client
                .update_status(&deployment_id, StatusReport::new(DeploymentStatus::Rebooting))
            {
                warn!("unable to report rebooting status: {report:?}");
            }
        }
        self.system.reboot()
    }
}

/// Check an image size against the capacity of its target.
///
/// UBI volume updates must declare exactly the number of bytes that will
/// be written before close, so the size has to match the volume capacity
/// instead of merely fitting it.
fn validate_capacity(is_ubi: bool, capacity: u64, size: u64) -> InstallResult<()> {
    if capacity < size {
        error!("update ({size} bytes) is larger than the target device ({capacity} bytes)");
        return Err(Report::new(InstallError::OutOfSpace));
    }
    if is_ubi && capacity != size {
        bail!(
            "UBI volume update must cover the full volume: image is {size} bytes, volume holds {capacity}"
        );
    }
    Ok(())
}

/// Copy the artifact stream to the device, observing cancellation and
/// keeping the shared progress counter current.
fn pump(
    reader: &mut dyn Read,
    device: &mut PartitionDevice,
    cancel: &CancelToken,
    written: &AtomicU64,
) -> io::Result<u64> {
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "installation cancelled",
            ));
        }
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        device.write_all(&buffer[..read])?;
        copied += read as u64;
        written.fetch_add(read as u64, Ordering::Relaxed);
    }
    Ok(copied)
}

struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a CancelToken,
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "installation cancelled",
            ));
        }
        self.inner.read(buf)
    }
}

struct CountingWriter<'a, W> {
    inner: W,
    written: &'a AtomicU64,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.written.fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::io::{BufRead, BufReader, Read as _, Write as _};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    use otaris_client::auth::AuthManager;
    use otaris_client::deployments::{Artifact, ArtifactSource};
    use otaris_client::identity::DeviceIdentity;
    use otaris_client::keystore::{KeyAlgorithm, Keystore};
    use otaris_client::{ServerDescriptor, TlsOptions, UpdateInfo};
    use otaris_common::boot::{MemEnv, BOOT_PART_VAR};

    use crate::system::PartitionSet;

    use super::*;

    #[test]
    fn test_validate_capacity() {
        assert!(validate_capacity(false, 100, 100).is_ok());
        assert!(validate_capacity(false, 100, 50).is_ok());
        let report = validate_capacity(false, 100, 101).unwrap_err();
        assert!(matches!(report.error(), InstallError::OutOfSpace));
        // UBI volume updates must cover the full volume.
        assert!(validate_capacity(true, 100, 100).is_ok());
        assert!(validate_capacity(true, 100, 50).is_err());
        let report = validate_capacity(true, 100, 101).unwrap_err();
        assert!(matches!(report.error(), InstallError::OutOfSpace));
    }

    #[derive(Debug)]
    struct Request {
        method: String,
        path: String,
    }

    /// Minimal loopback HTTP server answering with the given responses in
    /// order.
    fn spawn_server(responses: Vec<(u16, Vec<u8>)>) -> (String, Arc<Mutex<Vec<Request>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let requests = recorded.clone();
        std::thread::spawn(move || {
            for (status, body) in responses {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                let mut reader = BufReader::new(stream);
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    return;
                }
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_owned();
                let path = parts.next().unwrap_or_default().to_owned();
                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                        break;
                    }
                    if let Some((name, value)) = line.trim_end().split_once(':') {
                        if name.trim().eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().unwrap_or(0);
                        }
                    }
                }
                let mut request_body = vec![0; content_length];
                if content_length > 0 && reader.read_exact(&mut request_body).is_err() {
                    return;
                }
                requests.lock().unwrap().push(Request { method, path });
                let mut stream = reader.into_inner();
                let _ = stream.write_all(
                    format!(
                        "HTTP/1.1 {status} X\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
                        body.len()
                    )
                    .as_bytes(),
                );
                let _ = stream.write_all(&body);
            }
        });
        (url, recorded)
    }

    fn test_client(dir: &tempfile::TempDir, url: &str) -> ApiClient {
        let store = Store::open(dir.path().join("client-store")).unwrap();
        let mut keystore = Keystore::new(dir.path().join("device.key"));
        keystore.generate(KeyAlgorithm::Ed25519).unwrap();
        let mut attributes = BTreeMap::new();
        attributes.insert("mac".to_owned(), "de:ad:be:ef:00:01".to_owned());
        let identity = DeviceIdentity::from_attributes(&attributes).unwrap();
        ApiClient::new(
            vec![ServerDescriptor::new(url, "")],
            UpdateInfo {
                device_type: "rpi3".to_owned(),
                artifact_name: "release-1".to_owned(),
            },
            AuthManager::new(store, keystore, identity),
            &TlsOptions::default(),
        )
        .unwrap()
    }

    fn test_installer(
        dir: &tempfile::TempDir,
        url: &str,
        target_size: u64,
        active_content: &[u8],
    ) -> Installer {
        let part_a = dir.path().join("rootfs2");
        let part_b = dir.path().join("rootfs3");
        fs::write(&part_a, active_content).unwrap();
        let target = fs::File::create(&part_b).unwrap();
        target.set_len(target_size).unwrap();

        let system = System::new(
            Box::new(MemEnv::with_vars([(BOOT_PART_VAR, "2")])),
            part_a.to_str().unwrap().to_owned(),
            part_b.to_str().unwrap().to_owned(),
        )
        .unwrap();
        let store = Store::open(dir.path().join("agent-store")).unwrap();
        Installer::new(test_client(dir, url), system, store, CancelToken::new())
    }

    fn instructions(url: Option<String>) -> DeploymentInstructions {
        DeploymentInstructions {
            deployment_id: "dep-1".to_owned(),
            artifact: Artifact {
                artifact_name: "release-2".to_owned(),
                device_types: vec!["rpi3".to_owned()],
                source: ArtifactSource { url, expire: None },
            },
        }
    }

    #[test]
    fn test_full_image_install() {
        let payload = b"new-rootfs-image";
        let (url, requests) = spawn_server(vec![
            (204, Vec::new()),
            (200, payload.to_vec()),
            (204, Vec::new()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let mut installer = test_installer(&dir, &url, payload.len() as u64, b"old");
        installer
            .install_deployment(
                &instructions(Some(format!("{url}/artifact"))),
                InstallOptions::default(),
            )
            .unwrap();

        // The image landed on the inactive partition and the boot
        // environment now points at it with the upgrade flag set.
        assert_eq!(fs::read(dir.path().join("rootfs3")).unwrap(), payload);
        assert!(installer.system().has_update().unwrap());
        assert_eq!(installer.system().active_set().unwrap(), PartitionSet::B);
        assert_eq!(
            installer.store.read("deployment-id").unwrap().as_deref(),
            Some(&b"dep-1"[..])
        );

        let requests = requests.lock().unwrap();
        let summary: Vec<_> = requests
            .iter()
            .map(|request| (request.method.as_str(), request.path.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("PUT", "/api/v1/deployments/device/deployments/dep-1/status"),
                ("GET", "/artifact"),
                ("PUT", "/api/v1/deployments/device/deployments/dep-1/status"),
            ]
        );
    }

    #[test]
    fn test_delta_install() {
        // A single-window patch copying four bytes from the source.
        let patch = vec![
            0xD6, 0xC3, 0xC4, 0x00, 0x00, // header
            0x01, 4, 0, // window over source bytes 0..4
            8,  // delta encoding length
            4,  // target window length
            0,  // delta indicator
            0, 1, 1,  // section lengths
            20, // COPY size 4 mode 0
            0,  // address
        ];
        let (url, _requests) = spawn_server(vec![
            (204, Vec::new()),
            (200, patch),
            (204, Vec::new()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let mut installer = test_installer(&dir, &url, 4, b"abcd");
        installer
            .install_deployment(
                &instructions(Some(format!("{url}/patch"))),
                InstallOptions {
                    delta: true,
                    rootfs_size: Some(4),
                    ..InstallOptions::default()
                },
            )
            .unwrap();
        assert_eq!(fs::read(dir.path().join("rootfs3")).unwrap(), b"abcd");
        assert!(installer.system().has_update().unwrap());
    }

    #[test]
    fn test_aborted_deployment_leaves_boot_env_untouched() {
        let (url, requests) = spawn_server(vec![(409, Vec::new())]);
        let dir = tempfile::tempdir().unwrap();
        let mut installer = test_installer(&dir, &url, 16, b"old");
        let report = installer
            .install_deployment(
                &instructions(Some(format!("{url}/artifact"))),
                InstallOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(report.error(), InstallError::Aborted));
        // The server aborted before the download: no boot environment
        // mutation, no failure report.
        assert!(!installer.system().has_update().unwrap());
        assert_eq!(installer.system().active_set().unwrap(), PartitionSet::A);
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    fn commit_installer(dir: &tempfile::TempDir, url: &str, running_root: &str) -> Installer {
        // The device rebooted with the upgrade flag set and partition 3
        // enabled; `running_root` decides whether the bootloader actually
        // booted it or fell back.
        let system = System::new(
            Box::new(MemEnv::with_vars([
                (BOOT_PART_VAR, "3"),
                (otaris_common::boot::UPGRADE_AVAILABLE_VAR, "1"),
            ])),
            "/dev/mmcblk0p2".to_owned(),
            "/dev/mmcblk0p3".to_owned(),
        )
        .unwrap()
        .with_running_root(running_root);
        let store = Store::open(dir.path().join("agent-store")).unwrap();
        store.write("deployment-id", b"dep-1").unwrap();
        Installer::new(test_client(dir, url), system, store, CancelToken::new())
    }

    #[test]
    fn test_commit_after_successful_boot() {
        let (url, requests) = spawn_server(vec![(204, Vec::new())]);
        let dir = tempfile::tempdir().unwrap();
        let mut installer = commit_installer(&dir, &url, "/dev/mmcblk0p3");

        installer.commit().unwrap();
        assert!(!installer.system().has_update().unwrap());
        assert_eq!(installer.store.read("deployment-id").unwrap(), None);
        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].method, "PUT");
        assert!(requests[0].path.ends_with("/dep-1/status"));
    }

    #[test]
    fn test_commit_after_bootloader_fallback() {
        // One log push and one failure report.
        let (url, requests) = spawn_server(vec![(204, Vec::new()), (204, Vec::new())]);
        let dir = tempfile::tempdir().unwrap();
        let mut installer = commit_installer(&dir, &url, "/dev/mmcblk0p2");

        assert!(installer.commit().is_err());
        // The rollback points the bootloader back at the booted partition.
        assert!(!installer.system().has_update().unwrap());
        assert_eq!(installer.system().active_set().unwrap(), PartitionSet::A);
        assert_eq!(installer.store.read("deployment-id").unwrap(), None);
        let requests = requests.lock().unwrap();
        assert!(requests[0].path.ends_with("/dep-1/log"));
        assert!(requests[1].path.ends_with("/dep-1/status"));
    }

    #[test]
    fn test_commit_without_pending_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = test_installer(&dir, "http://127.0.0.1:1", 16, b"old");
        let report = installer.commit().unwrap_err();
        assert!(matches!(report.error(), InstallError::NothingToCommit));
    }
}

