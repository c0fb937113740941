//! Persistent key-value store.
//!
//! Values live as individual files in a directory configured by the host,
//! written via a temporary file and rename so a power loss never leaves a
//! half-written value behind.

use std::fs;
use std::path::PathBuf;

use reportify::{bail, ErrorExt, ResultExt};

use crate::SystemResult;

/// Directory-backed store for small opaque values.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Open the store, creating the directory if necessary.
    pub fn open(dir: impl Into<PathBuf>) -> SystemResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .whatever("unable to create store directory")
            .with_info(|_| format!("directory: {dir:?}"))?;
        Ok(Self { dir })
    }

    fn entry_path(&self, key: &str) -> SystemResult<PathBuf> {
        if key.is_empty() || key.contains(['/', '\0']) || key.starts_with('.') {
            bail!("invalid store key {key:?}");
        }
        Ok(self.dir.join(key))
    }

    /// Read the value stored under `key`, if any.
    pub fn read(&self, key: &str) -> SystemResult<Option<Vec<u8>>> {
        let path = self.entry_path(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => {
                let mut report = error.whatever("unable to read store entry");
                report.add_info(format!("key: {key}"));
                Err(report)
            }
        }
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn write(&self, key: &str, value: &[u8]) -> SystemResult<()> {
        let path = self.entry_path(key)?;
        let staged = self.dir.join(format!(".{key}.new"));
        fs::write(&staged, value)
            .whatever("unable to stage store entry")
            .with_info(|_| format!("key: {key}"))?;
        fs::rename(&staged, &path)
            .whatever("unable to commit store entry")
            .with_info(|_| format!("key: {key}"))
    }

    /// Remove the value stored under `key`, if any.
    pub fn remove(&self, key: &str) -> SystemResult<()> {
        let path = self.entry_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => {
                let mut report = error.whatever("unable to remove store entry");
                report.add_info(format!("key: {key}"));
                Err(report)
            }
        }
    }
}
