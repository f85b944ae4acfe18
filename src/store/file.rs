use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use super::{validate_key, DurableStore, StoreError};

/// One JSON file per key inside a directory.
///
/// Writes go to a `.tmp` sibling first and are renamed into place, so a crash
/// mid-write leaves the previous value intact.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}.json", key.replace(':', "__"))))
    }
}

/// Atomic write: write to a .tmp sibling then rename into place.
pub(crate) fn atomic_write(path: &Path, contents: &str) -> Result<(), std::io::Error> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Json {
                key: key.to_string(),
                source,
            })
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let content = serde_json::to_string_pretty(&value).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })?;
        atomic_write(&path, &content)?;
        tracing::trace!(key = %key, bytes = content.len(), "Store write");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".json") {
                keys.push(stem.replace("__", ":"));
            }
        }
        keys.sort();
        Ok(keys)
    }
}
