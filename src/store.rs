use crate::error::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Read and deserialize a JSON file, returning `None` if it doesn't exist.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path) {
        Ok(s) => {
            let val = serde_json::from_str(&s).map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Some(val))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Serialize `value` as pretty JSON and replace `path` with it.
///
/// The content goes to a temp file in the same directory first and is then
/// renamed over the target, so readers see either the old or the new file.
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    serde_json::to_writer_pretty(&mut tmp, value)
        .map_err(|e| StoreError::io(path, io::Error::from(e)))?;
    tmp.write_all(b"\n").map_err(|e| StoreError::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Local wall-clock time as ISO-8601 with microseconds, e.g.
/// `2024-05-01T09:30:00.123456`.
pub fn now_iso8601() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}
