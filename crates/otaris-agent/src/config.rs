//! Agent configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reportify::{bail, ResultExt};
use serde::Deserialize;

use otaris_client::keystore::KeyAlgorithm;
use otaris_common::boot::uboot::UBootEnvFile;
use otaris_common::boot::{BootEnv, FwEnv};
use otaris_common::{SystemResult, SystemError};

/// Default path of the agent configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/otaris/otaris.toml";

/// Structure of the agent configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Management servers, in order of preference.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Tenant token used for servers without their own token.
    pub tenant_token: Option<String>,
    /// Path of the rootfs A partition.
    pub rootfs_part_a: Option<String>,
    /// Path of the rootfs B partition.
    pub rootfs_part_b: Option<String>,
    /// Self-signed server certificate appended to the trust roots.
    pub server_certificate: Option<PathBuf>,
    /// Skip certificate verification; development only.
    #[serde(default)]
    pub skip_verify: bool,
    /// Directory for persistent agent state.
    pub data_dir: Option<PathBuf>,
    /// Path of the device key.
    pub key_path: Option<PathBuf>,
    /// Algorithm used when generating a missing device key.
    #[serde(default)]
    pub key_algorithm: KeyAlgorithmConfig,
    /// Path of the device type file.
    pub device_type_path: Option<PathBuf>,
    /// Path of the artifact info file.
    pub artifact_info_path: Option<PathBuf>,
    /// Identity attributes sent in the authentication request.
    #[serde(default)]
    pub identity: BTreeMap<String, String>,
    /// Additional inventory attributes.
    #[serde(default)]
    pub inventory: BTreeMap<String, String>,
    /// Seconds between deployment polls in daemon mode.
    pub update_poll_interval_seconds: Option<u64>,
    /// Seconds before a failed poll is retried in daemon mode.
    pub retry_poll_interval_seconds: Option<u64>,
    /// Seconds between progress reports during an install.
    pub progress_interval_seconds: Option<u64>,
    /// Bootloader environment backend.
    pub boot_env: Option<BootEnvConfig>,
}

/// A single management server entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    pub tenant_token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithmConfig {
    #[default]
    Rsa3072,
    P256,
    Ed25519,
}

impl From<KeyAlgorithmConfig> for KeyAlgorithm {
    fn from(config: KeyAlgorithmConfig) -> Self {
        match config {
            KeyAlgorithmConfig::Rsa3072 => KeyAlgorithm::Rsa3072,
            KeyAlgorithmConfig::P256 => KeyAlgorithm::EcdsaP256,
            KeyAlgorithmConfig::Ed25519 => KeyAlgorithm::Ed25519,
        }
    }
}

/// Bootloader environment backend selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BootEnvConfig {
    /// The `fw_printenv`/`fw_setenv` tools.
    Tools {
        printenv: Option<PathBuf>,
        setenv: Option<PathBuf>,
    },
    /// A U-Boot environment file written directly.
    File { path: PathBuf },
}

impl AgentConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/lib/otaris"))
    }

    pub fn key_path(&self) -> PathBuf {
        self.key_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("device.key"))
    }

    pub fn device_type_path(&self) -> PathBuf {
        self.device_type_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("device_type"))
    }

    pub fn artifact_info_path(&self) -> PathBuf {
        self.artifact_info_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("/etc/otaris/artifact_info"))
    }

    /// The device type as written during setup.
    pub fn device_type(&self) -> SystemResult<String> {
        read_tagged_value(&self.device_type_path(), "device_type")
    }

    /// The name of the currently installed artifact.
    pub fn artifact_name(&self) -> SystemResult<String> {
        read_tagged_value(&self.artifact_info_path(), "artifact_name")
    }

    pub fn update_poll_interval(&self) -> Duration {
        Duration::from_secs(self.update_poll_interval_seconds.unwrap_or(1800))
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_secs(self.retry_poll_interval_seconds.unwrap_or(300))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_seconds.unwrap_or(30))
    }

    /// The configured rootfs partition pair.
    pub fn partitions(&self) -> SystemResult<(String, String)> {
        match (&self.rootfs_part_a, &self.rootfs_part_b) {
            (Some(a), Some(b)) => Ok((a.clone(), b.clone())),
            _ => bail!("rootfs_part_a and rootfs_part_b must be configured"),
        }
    }

    /// Construct the configured bootloader environment backend.
    pub fn boot_env(&self) -> Box<dyn BootEnv> {
        match &self.boot_env {
            Some(BootEnvConfig::File { path }) => Box::new(UBootEnvFile::new(path.clone())),
            Some(BootEnvConfig::Tools { printenv, setenv }) => {
                let default = FwEnv::new();
                Box::new(match (printenv, setenv) {
                    (Some(printenv), Some(setenv)) => {
                        FwEnv::with_tools(printenv.clone(), setenv.clone())
                    }
                    _ => default,
                })
            }
            None => Box::new(FwEnv::new()),
        }
    }
}

/// Load the agent configuration, falling back to defaults when the file
/// does not exist.
pub fn load_config(path: impl AsRef<Path>) -> SystemResult<AgentConfig> {
    let path = path.as_ref();
    if path.exists() {
        toml::from_str(
            &fs::read_to_string(path)
                .whatever("unable to read config")
                .with_info(|_: &SystemError| format!("path: {path:?}"))?,
        )
        .whatever("unable to parse config")
    } else {
        Ok(AgentConfig::default())
    }
}

/// Read a `<key>=<value>` line from a tagged file, e.g. the device type
/// file written during setup.
fn read_tagged_value(path: &Path, key: &str) -> SystemResult<String> {
    let content = fs::read_to_string(path)
        .whatever("unable to read tagged file")
        .with_info(|_| format!("path: {path:?}"))?;
    for line in content.lines() {
        if let Some((name, value)) = line.split_once('=') {
            if name.trim() == key {
                return Ok(value.trim().to_owned());
            }
        }
    }
    bail!("no {key} entry in {path:?}")
}
