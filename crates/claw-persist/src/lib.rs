//! JSON file-backed snapshot persistence.
//!
//! [`JsonStore`] owns one snapshot file (`<dir>/<name>.json`). Saves are
//! atomic: the payload is written to `<name>.json.tmp`, flushed, and renamed
//! over the previous snapshot, so readers never observe a half-written file.
//! Loads never fail: a missing or unreadable snapshot yields `T::default()`
//! and the caller starts cold.

#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// A single JSON snapshot file inside a state directory.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Creates a store for `<state_path>/<name>.json`.
    ///
    /// The directory is created lazily on the first [`save`](Self::save).
    pub fn new(state_path: &Path, name: &str) -> Self {
        Self {
            path: state_path.join(format!("{name}.json")),
        }
    }

    /// Returns the snapshot file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot, falling back to `T::default()` when the file is
    /// missing or cannot be parsed.
    pub fn load<T>(&self) -> T
    where
        T: DeserializeOwned + Default,
    {
        match self.try_load() {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!(path = %self.path.display(), "no snapshot found, starting empty");
                T::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to load snapshot, starting empty");
                T::default()
            }
        }
    }

    /// Loads the snapshot, distinguishing "absent" from "corrupt".
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn try_load<T>(&self) -> io::Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Atomically replaces the snapshot with `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails. The
    /// previous snapshot is left untouched in that case.
    pub fn save<T>(&self, value: &T) -> io::Result<()>
    where
        T: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(&self.path, &bytes)
    }
}

/// Writes `contents` to `path` via a sibling temp file and a rename.
///
/// # Errors
///
/// Returns an error if the parent directory cannot be created or the write,
/// sync, or rename fails.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
