//! Rootfs partition pair and boot state.
//!
//! The device carries two rootfs partitions; the bootloader environment
//! selects the active one. Installs write only to the inactive partition
//! and flip the boot variables afterwards, so a failed update leaves the
//! running system untouched.

use reportify::{bail, Report, ResultExt};
use thiserror::Error;
use tracing::{debug, info};
use xscript::{read_str, run, Run};

use otaris_common::boot::{
    boot_vars, BootEnv, BootVars, BOOTCOUNT_VAR, BOOT_PART_HEX_VAR, BOOT_PART_VAR,
    UPGRADE_AVAILABLE_VAR,
};

/// Errors of the install pipeline.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The update does not fit the target partition.
    #[error("out of space on the target partition")]
    OutOfSpace,
    /// The deployment was aborted on the server.
    #[error("deployment was aborted")]
    Aborted,
    #[error("artifact already installed")]
    AlreadyInstalled,
    #[error("installation was cancelled")]
    Cancelled,
    /// There is no update awaiting a commit.
    #[error("there is nothing to commit")]
    NothingToCommit,
    /// Error while writing to the target partition; reported as a
    /// deployment failure.
    #[error("fatal error while installing the update")]
    Fatal,
    #[error("install error")]
    Other,
}

impl reportify::Whatever for InstallError {
    fn new() -> Self {
        InstallError::Other
    }
}

/// Result with an [`InstallError`] report.
pub type InstallResult<T> = Result<T, Report<InstallError>>;

impl From<&otaris_client::ClientError> for InstallError {
    fn from(error: &otaris_client::ClientError) -> Self {
        match error {
            otaris_client::ClientError::DeploymentAborted => InstallError::Aborted,
            otaris_client::ClientError::AlreadyInstalled => InstallError::AlreadyInstalled,
            _ => InstallError::Other,
        }
    }
}

/// One side of the rootfs partition pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionSet {
    A,
    B,
}

impl PartitionSet {
    pub fn flipped(self) -> Self {
        match self {
            PartitionSet::A => Self::B,
            PartitionSet::B => Self::A,
        }
    }
}

/// The system's partition pair and bootloader environment.
pub struct System {
    env: Box<dyn BootEnv>,
    rootfs_part_a: String,
    rootfs_part_b: String,
    running_root: Option<String>,
}

impl System {
    pub fn new(
        env: Box<dyn BootEnv>,
        rootfs_part_a: String,
        rootfs_part_b: String,
    ) -> InstallResult<Self> {
        if rootfs_part_a == rootfs_part_b {
            bail!("rootfs partitions A and B must name different devices");
        }
        Ok(Self {
            env,
            rootfs_part_a,
            rootfs_part_b,
            running_root: None,
        })
    }

    /// Override the detected running root partition.
    pub fn with_running_root(mut self, root: impl Into<String>) -> Self {
        self.running_root = Some(root.into());
        self
    }

    pub fn partition_path(&self, set: PartitionSet) -> &str {
        match set {
            PartitionSet::A => &self.rootfs_part_a,
            PartitionSet::B => &self.rootfs_part_b,
        }
    }

    /// The partition set the bootloader currently boots from.
    pub fn active_set(&self) -> InstallResult<PartitionSet> {
        let vars = self
            .env
            .read_env(&[BOOT_PART_VAR])
            .whatever("unable to read bootloader environment")?;
        let Some(value) = vars.get(BOOT_PART_VAR) else {
            bail!("bootloader environment does not contain {BOOT_PART_VAR}");
        };
        if partition_matches(&self.rootfs_part_a, value) {
            Ok(PartitionSet::A)
        } else if partition_matches(&self.rootfs_part_b, value) {
            Ok(PartitionSet::B)
        } else {
            bail!("unable to determine active partition set from {BOOT_PART_VAR}={value}")
        }
    }

    /// Path of the active rootfs partition.
    pub fn active_partition(&self) -> InstallResult<&str> {
        Ok(self.partition_path(self.active_set()?))
    }

    /// Path of the inactive rootfs partition; the only install target.
    pub fn inactive_partition(&self) -> InstallResult<&str> {
        Ok(self.partition_path(self.active_set()?.flipped()))
    }

    fn write_env(&mut self, vars: &BootVars) -> InstallResult<()> {
        debug!("writing boot environment: {vars:?}");
        self.env
            .write_env(vars)
            .whatever("unable to write bootloader environment")
    }

    /// Mark the freshly written inactive partition as the boot candidate.
    pub fn enable_updated_partition(&mut self) -> InstallResult<()> {
        let inactive = self.inactive_partition()?.to_owned();
        let (number, hex) = partition_numbers(&inactive)?;
        info!("enabling partition {inactive} with new image to be a boot candidate");
        self.write_env(&boot_vars([
            (UPGRADE_AVAILABLE_VAR, "1"),
            (BOOT_PART_VAR, &number),
            (BOOT_PART_HEX_VAR, &hex),
            (BOOTCOUNT_VAR, "0"),
        ]))?;
        debug!("marking inactive partition as a boot candidate successful");
        Ok(())
    }

    /// The partition set the device is actually running from.
    ///
    /// After a bootloader fallback this differs from [`System::active_set`],
    /// which reflects what the environment asked the bootloader to boot.
    pub fn booted_set(&mut self) -> InstallResult<PartitionSet> {
        let root = self.running_root()?;
        for set in [PartitionSet::A, PartitionSet::B] {
            let path = self.partition_path(set);
            if path == root
                || (partition_number(path).is_some()
                    && partition_number(path) == partition_number(&root))
            {
                return Ok(set);
            }
        }
        bail!("running root {root:?} does not match a configured rootfs partition")
    }

    /// Point the bootloader back at the partition the device is running
    /// from and clear the upgrade flag.
    pub fn write_rollback(&mut self) -> InstallResult<()> {
        let booted = self.booted_set()?;
        let active = self.partition_path(booted).to_owned();
        let (number, hex) = partition_numbers(&active)?;
        info!("setting partition for rollback: {active}");
        self.write_env(&boot_vars([
            (UPGRADE_AVAILABLE_VAR, "0"),
            (BOOT_PART_VAR, &number),
            (BOOT_PART_HEX_VAR, &hex),
            (BOOTCOUNT_VAR, "0"),
        ]))
    }

    /// Make the inactive partition the boot partition without an install.
    pub fn swap_partitions(&mut self) -> InstallResult<()> {
        let inactive = self.inactive_partition()?.to_owned();
        let (number, hex) = partition_numbers(&inactive)?;
        info!("swapping boot partition to {inactive}");
        self.write_env(&boot_vars([
            (UPGRADE_AVAILABLE_VAR, "0"),
            (BOOT_PART_VAR, &number),
            (BOOT_PART_HEX_VAR, &hex),
        ]))
    }

    /// Whether an update awaits its first successful boot.
    pub fn has_update(&self) -> InstallResult<bool> {
        let vars = self
            .env
            .read_env(&[UPGRADE_AVAILABLE_VAR])
            .whatever("unable to read bootloader environment")?;
        Ok(vars.get(UPGRADE_AVAILABLE_VAR).map(String::as_str) == Some("1"))
    }

    /// Clear the upgrade flag after a successful boot.
    pub fn commit_update(&mut self) -> InstallResult<()> {
        if !self.has_update()? {
            return Err(Report::new(InstallError::NothingToCommit));
        }
        info!("committing update");
        self.write_env(&boot_vars([(UPGRADE_AVAILABLE_VAR, "0")]))
    }

    /// Whether the running root is the partition the bootloader was told
    /// to boot. `false` means the bootloader fell back.
    pub fn booted_from_enabled(&mut self) -> InstallResult<bool> {
        let vars = self
            .env
            .read_env(&[BOOT_PART_VAR])
            .whatever("unable to read bootloader environment")?;
        let Some(enabled) = vars.get(BOOT_PART_VAR).cloned() else {
            bail!("bootloader environment does not contain {BOOT_PART_VAR}");
        };
        let root = self.running_root()?;
        Ok(partition_matches(&root, &enabled))
    }

    fn running_root(&mut self) -> InstallResult<String> {
        if let Some(root) = &self.running_root {
            return Ok(root.clone());
        }
        let root = read_str!(["findmnt", "-n", "-o", "SOURCE", "/"])
            .whatever("unable to determine the running root partition")?;
        self.running_root = Some(root.clone());
        Ok(root)
    }

    /// Reboot the system.
    pub fn reboot(&self) -> InstallResult<()> {
        info!("rebooting from active partition {}", self.active_partition()?);
        run!(["reboot"]).whatever("unable to run `reboot`")?;
        Ok(())
    }
}

/// Trailing decimal partition number of a partition path.
fn partition_number(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches(|c: char| c.is_ascii_digit());
    let number = &path[trimmed.len()..];
    (!number.is_empty()).then_some(number)
}

/// Decimal and uppercase hexadecimal partition number of a path.
///
/// Paths without a trailing decimal suffix fail early, before any byte
/// has been written.
pub fn partition_numbers(path: &str) -> InstallResult<(String, String)> {
    let Some(number) = partition_number(path) else {
        bail!("invalid partition path {path:?}: missing trailing partition number");
    };
    let parsed: u64 = number
        .parse()
        .whatever("invalid partition number")
        .with_info(|_| format!("path: {path:?}"))?;
    Ok((number.to_owned(), format!("{parsed:X}")))
}

/// Whether a boot environment value names the given partition, either as
/// the full path or as the bare partition number.
fn partition_matches(path: &str, value: &str) -> bool {
    if path == value {
        return true;
    }
    match (partition_number(path), value.parse::<u64>()) {
        (Some(number), Ok(value)) => number.parse::<u64>().map(|n| n == value).unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use otaris_common::boot::MemEnv;

    use super::*;

    fn test_system(env: MemEnv) -> System {
        System::new(
            Box::new(env),
            "/dev/mmcblk0p2".to_owned(),
            "/dev/mmcblk0p3".to_owned(),
        )
        .unwrap()
    }

    #[test]
    fn test_partition_numbers() {
        assert_eq!(
            partition_numbers("/dev/mmcblk0p2").unwrap(),
            ("2".to_owned(), "2".to_owned())
        );
        assert_eq!(
            partition_numbers("/dev/mmcblk0p10").unwrap(),
            ("10".to_owned(), "A".to_owned())
        );
        assert_eq!(
            partition_numbers("ubi0_1").unwrap(),
            ("1".to_owned(), "1".to_owned())
        );
        assert!(partition_numbers("/dev/sda").is_err());
    }

    #[test]
    fn test_identical_partitions_are_rejected() {
        let result = System::new(
            Box::new(MemEnv::new()),
            "/dev/sda2".to_owned(),
            "/dev/sda2".to_owned(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_active_and_inactive_resolution() {
        let system = test_system(MemEnv::with_vars([(BOOT_PART_VAR, "2")]));
        assert_eq!(system.active_partition().unwrap(), "/dev/mmcblk0p2");
        assert_eq!(system.inactive_partition().unwrap(), "/dev/mmcblk0p3");

        // Full paths are accepted as well.
        let system = test_system(MemEnv::with_vars([(BOOT_PART_VAR, "/dev/mmcblk0p3")]));
        assert_eq!(system.active_set().unwrap(), PartitionSet::B);
        assert_eq!(system.inactive_partition().unwrap(), "/dev/mmcblk0p2");

        let system = test_system(MemEnv::with_vars([(BOOT_PART_VAR, "7")]));
        assert!(system.active_set().is_err());
    }

    #[test]
    fn test_enable_updated_partition_sets_boot_vars() {
        let env = MemEnv::with_vars([(BOOT_PART_VAR, "2")]);
        let mut system = test_system(env);
        system.enable_updated_partition().unwrap();
        let vars = system
            .env
            .read_env(&[
                BOOT_PART_VAR,
                BOOT_PART_HEX_VAR,
                UPGRADE_AVAILABLE_VAR,
                BOOTCOUNT_VAR,
            ])
            .unwrap();
        assert_eq!(vars.get(BOOT_PART_VAR).unwrap(), "3");
        assert_eq!(vars.get(BOOT_PART_HEX_VAR).unwrap(), "3");
        assert_eq!(vars.get(UPGRADE_AVAILABLE_VAR).unwrap(), "1");
        assert_eq!(vars.get(BOOTCOUNT_VAR).unwrap(), "0");
    }

    #[test]
    fn test_commit_update() {
        let env = MemEnv::with_vars([(BOOT_PART_VAR, "3"), (UPGRADE_AVAILABLE_VAR, "1")]);
        let mut system = test_system(env);
        assert!(system.has_update().unwrap());
        system.commit_update().unwrap();
        assert!(!system.has_update().unwrap());
        let report = system.commit_update().unwrap_err();
        assert!(matches!(report.error(), InstallError::NothingToCommit));
    }

    #[test]
    fn test_booted_from_enabled() {
        let env = MemEnv::with_vars([(BOOT_PART_VAR, "3")]);
        let mut system = test_system(env).with_running_root("/dev/mmcblk0p3");
        assert!(system.booted_from_enabled().unwrap());

        let env = MemEnv::with_vars([(BOOT_PART_VAR, "3")]);
        let mut system = test_system(env).with_running_root("/dev/mmcblk0p2");
        assert!(!system.booted_from_enabled().unwrap());
    }

    #[test]
    fn test_rollback_points_at_booted_partition() {
        // The environment was flipped to partition 3, but the bootloader
        // fell back to partition 2; the rollback must follow the running
        // system, not the environment.
        let env = MemEnv::with_vars([(BOOT_PART_VAR, "3"), (UPGRADE_AVAILABLE_VAR, "1")]);
        let mut system = test_system(env).with_running_root("/dev/mmcblk0p2");
        system.write_rollback().unwrap();
        let vars = system
            .env
            .read_env(&[BOOT_PART_VAR, UPGRADE_AVAILABLE_VAR])
            .unwrap();
        assert_eq!(vars.get(BOOT_PART_VAR).unwrap(), "2");
        assert_eq!(vars.get(UPGRADE_AVAILABLE_VAR).unwrap(), "0");
    }
}
