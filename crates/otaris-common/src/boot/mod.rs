//! Bootloader environment access.
//!
//! The boot environment selects which rootfs partition boots and tracks the
//! state of an update across reboots. The agent reads and writes exactly
//! four variables: the active partition number (decimal and hexadecimal),
//! the upgrade flag, and the boot counter.

use std::collections::BTreeMap;
use std::path::PathBuf;

use reportify::ResultExt;
use xscript::{read_str, run, Run};

use crate::SystemResult;

pub mod uboot;

/// Partition number the bootloader boots from.
pub const BOOT_PART_VAR: &str = "mender_boot_part";
/// Hexadecimal rendering of [`BOOT_PART_VAR`] for bootloaders that index
/// partitions in hex.
pub const BOOT_PART_HEX_VAR: &str = "mender_boot_part_hex";
/// Set to `1` while an update awaits its first successful boot.
pub const UPGRADE_AVAILABLE_VAR: &str = "upgrade_available";
/// Boot attempt counter used by the bootloader for fallback.
pub const BOOTCOUNT_VAR: &str = "bootcount";

/// A set of boot environment variables.
pub type BootVars = BTreeMap<String, String>;

/// Build a [`BootVars`] map from key-value pairs.
pub fn boot_vars<const N: usize>(vars: [(&str, &str); N]) -> BootVars {
    vars.iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Read and write access to the bootloader environment.
pub trait BootEnv {
    /// Read the given variables; unset variables are absent from the result.
    fn read_env(&self, keys: &[&str]) -> SystemResult<BootVars>;

    /// Write the given variables.
    fn write_env(&mut self, vars: &BootVars) -> SystemResult<()>;
}

/// Boot environment backed by the `fw_printenv`/`fw_setenv` tools.
#[derive(Debug, Clone)]
pub struct FwEnv {
    printenv: PathBuf,
    setenv: PathBuf,
}

impl FwEnv {
    pub fn new() -> Self {
        Self {
            printenv: PathBuf::from("fw_printenv"),
            setenv: PathBuf::from("fw_setenv"),
        }
    }

    /// Use tools at the given paths instead of resolving them via `PATH`.
    pub fn with_tools(printenv: PathBuf, setenv: PathBuf) -> Self {
        Self { printenv, setenv }
    }
}

impl Default for FwEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl BootEnv for FwEnv {
    fn read_env(&self, keys: &[&str]) -> SystemResult<BootVars> {
        let mut vars = BootVars::new();
        for key in keys {
            // `fw_printenv` fails for unset variables; those are reported
            // as absent rather than as errors.
            let Ok(output) = read_str!([self.printenv.to_string_lossy(), key]) else {
                continue;
            };
            if let Some((name, value)) = output.trim().split_once('=') {
                if name == *key {
                    vars.insert(name.to_owned(), value.to_owned());
                }
            }
        }
        Ok(vars)
    }

    fn write_env(&mut self, vars: &BootVars) -> SystemResult<()> {
        for (key, value) in vars {
            run!([self.setenv.to_string_lossy(), key, value])
                .whatever("unable to set bootloader environment variable")
                .with_info(|_| format!("variable: {key}"))?;
        }
        Ok(())
    }
}

/// In-memory boot environment for development setups and tests.
#[derive(Debug, Clone, Default)]
pub struct MemEnv {
    vars: BootVars,
}

impl MemEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an environment pre-populated with the given variables.
    pub fn with_vars<const N: usize>(vars: [(&str, &str); N]) -> Self {
        Self {
            vars: boot_vars(vars),
        }
    }

    /// All variables currently set.
    pub fn vars(&self) -> &BootVars {
        &self.vars
    }
}

impl BootEnv for MemEnv {
    fn read_env(&self, keys: &[&str]) -> SystemResult<BootVars> {
        Ok(self
            .vars
            .iter()
            .filter(|(key, _)| keys.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_env(&mut self, vars: &BootVars) -> SystemResult<()> {
        for (key, value) in vars {
            self.vars.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}
