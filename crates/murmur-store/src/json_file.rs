//! Whole-file JSON persistence with atomic replacement.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Read a JSON array file. A missing file reads as empty.
pub fn read_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StoreError::Io(format!("read {}: {e}", path.display()))),
    }
}

/// Replace `path` with the JSON encoding of `value`.
///
/// Writes to a sibling temp file, then renames over the target, so readers
/// never observe a half-written file.
pub fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    let temp_path = path.with_extension("json.tmp");

    fs::write(&temp_path, json)
        .map_err(|e| StoreError::Io(format!("write {}: {e}", temp_path.display())))?;
    fs::rename(&temp_path, path)
        .map_err(|e| StoreError::Io(format!("rename {}: {e}", path.display())))?;
    Ok(())
}

/// Create `path` holding an empty array unless it already exists.
pub fn ensure_array_file(path: &Path) -> Result<(), StoreError> {
    if path.exists() {
        return Ok(());
    }
    write_atomic(path, &Vec::<serde_json::Value>::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[test]
    fn missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let rows: Vec<Value> = read_array(&dir.path().join("nope.json")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.json");
        write_atomic(&path, &vec![json!({"id": 1}), json!({"id": 2})]).unwrap();

        let rows: Vec<Value> = read_array(&path).unwrap();
        assert_eq!(rows, vec![json!({"id": 1}), json!({"id": 2})]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_serialization_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[{").unwrap();
        let err = read_array::<Value>(&path).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn ensure_does_not_clobber() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        write_atomic(&path, &vec![json!({"id": "d"})]).unwrap();
        ensure_array_file(&path).unwrap();
        let rows: Vec<Value> = read_array(&path).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
