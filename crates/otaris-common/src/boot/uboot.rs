//! Direct access to U-Boot environment files.
//!
//! Some boards carry no `fw_*env` tools; for those the agent reads and
//! writes the bootloader environment file itself. On disk the environment
//! is a little-endian CRC32 checksum over the payload, followed by
//! NUL-terminated `key=value` entries and a final empty entry.

use std::path::PathBuf;

use reportify::{bail, ResultExt};

use crate::boot::{BootEnv, BootVars};
use crate::SystemResult;

/// Boot environment stored in a U-Boot environment file.
///
/// The whole file is rewritten on every update; a missing file starts out
/// as an empty environment so a fresh config partition can be populated.
#[derive(Debug, Clone)]
pub struct UBootEnvFile {
    path: PathBuf,
}

impl UBootEnvFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> SystemResult<BootVars> {
        if !self.path.exists() {
            return Ok(BootVars::new());
        }
        let data = std::fs::read(&self.path)
            .whatever("unable to read U-Boot environment")
            .with_info(|_| format!("path: {:?}", self.path))?;
        decode_env(&data).with_info(|_| format!("path: {:?}", self.path))
    }
}

impl BootEnv for UBootEnvFile {
    fn read_env(&self, keys: &[&str]) -> SystemResult<BootVars> {
        let mut vars = self.load()?;
        vars.retain(|key, _| keys.contains(&key.as_str()));
        Ok(vars)
    }

    fn write_env(&mut self, vars: &BootVars) -> SystemResult<()> {
        let mut environ = self.load()?;
        for (key, value) in vars {
            environ.insert(key.clone(), value.clone());
        }
        std::fs::write(&self.path, encode_env(&environ))
            .whatever("unable to write U-Boot environment")
            .with_info(|_| format!("path: {:?}", self.path))
    }
}

/// Decode the variables of a binary environment, verifying the checksum.
fn decode_env(data: &[u8]) -> SystemResult<BootVars> {
    let Some((checksum, payload)) = data.split_first_chunk::<4>() else {
        bail!("environment file is too short ({} bytes)", data.len());
    };
    let stored = u32::from_le_bytes(*checksum);
    let computed = crc32fast::hash(payload);
    if stored != computed {
        bail!("environment checksum mismatch (stored {stored:#010x}, computed {computed:#010x})");
    }
    let mut vars = BootVars::new();
    for entry in payload.split(|byte| *byte == 0) {
        if entry.is_empty() {
            continue;
        }
        let entry =
            std::str::from_utf8(entry).whatever("environment entry is not valid UTF-8")?;
        let Some((key, value)) = entry.split_once('=') else {
            bail!("environment entry {entry:?} is missing `=`");
        };
        vars.insert(key.to_owned(), value.to_owned());
    }
    Ok(vars)
}

/// Encode variables into a binary environment, checksum first.
fn encode_env(vars: &BootVars) -> Vec<u8> {
    let mut payload = Vec::new();
    for (key, value) in vars {
        payload.extend_from_slice(key.as_bytes());
        payload.push(b'=');
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }
    payload.push(0);
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    data.extend_from_slice(&payload);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{boot_vars, BOOT_PART_VAR, BOOTCOUNT_VAR, UPGRADE_AVAILABLE_VAR};

    #[test]
    fn test_encode_layout() {
        let data = encode_env(&boot_vars([("bootpart", "2")]));
        assert_eq!(&data[4..], b"bootpart=2\0\0");
        assert_eq!(
            u32::from_le_bytes(data[..4].try_into().unwrap()),
            crc32fast::hash(&data[4..])
        );
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut data = encode_env(&boot_vars([("bootpart", "3")]));
        assert!(decode_env(&data).is_ok());
        data[0] ^= 0xFF;
        assert!(decode_env(&data).is_err());
        // Files shorter than the checksum are rejected as well.
        assert!(decode_env(&[0, 1, 2]).is_err());
    }

    #[test]
    fn test_decode_rejects_entry_without_separator() {
        let mut payload = b"not-an-entry\0\0".to_vec();
        let mut data = crc32fast::hash(&payload).to_le_bytes().to_vec();
        data.append(&mut payload);
        assert!(decode_env(&data).is_err());
    }

    #[test]
    fn test_env_file_preserves_unrelated_vars() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = UBootEnvFile::new(dir.path().join("uboot.env"));
        env.write_env(&boot_vars([
            (BOOT_PART_VAR, "3"),
            (UPGRADE_AVAILABLE_VAR, "1"),
            (BOOTCOUNT_VAR, "0"),
        ]))
        .unwrap();
        // A partial update leaves the other variables intact.
        env.write_env(&boot_vars([(UPGRADE_AVAILABLE_VAR, "0")]))
            .unwrap();
        let vars = env
            .read_env(&[BOOT_PART_VAR, UPGRADE_AVAILABLE_VAR, BOOTCOUNT_VAR])
            .unwrap();
        assert_eq!(vars.get(BOOT_PART_VAR).unwrap(), "3");
        assert_eq!(vars.get(UPGRADE_AVAILABLE_VAR).unwrap(), "0");
        assert_eq!(vars.get(BOOTCOUNT_VAR).unwrap(), "0");
    }

    #[test]
    fn test_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let env = UBootEnvFile::new(dir.path().join("uboot.env"));
        assert!(env.read_env(&[BOOT_PART_VAR]).unwrap().is_empty());
    }
}
