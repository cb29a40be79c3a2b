//! Path layout and atomic file I/O.
//!
//! Every entity lives in its own directory under `<base>/data/<schema>/`.
//! Document writes go through a temp-file + fsync + rename sequence so a
//! reader never observes a half-written file; read-modify-write sequences
//! are serialised by an exclusive advisory lock on the entity's `.lock`
//! file.

use crate::{Error, LOCK_FILE, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn data_dir(base: &Path, schema: &str) -> PathBuf {
    base.join("data").join(schema)
}

pub fn schema_dir(base: &Path, schema: &str) -> PathBuf {
    base.join("schema").join(schema)
}

pub fn entity_dir(base: &Path, schema: &str, entity: &str) -> PathBuf {
    data_dir(base, schema).join(entity)
}

pub fn doc_path(entity_dir: &Path, id: u64) -> PathBuf {
    entity_dir.join(format!("{id}.json"))
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn valid_entity_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn check_entity_name(name: &str) -> Result<()> {
    if valid_entity_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidEntityName(name.to_string()))
    }
}

/// Writes `bytes` to `path` atomically: temp sibling, fsync, rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    // Readers only need the rename barrier; directory sync is best-effort.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

pub fn atomic_write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| Error::CorruptJson {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');
    atomic_write(path, &bytes)
}

/// Reads and parses a JSON document; `Ok(None)` when the file is absent.
pub fn read_json(path: &Path) -> Result<Option<serde_json::Value>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_slice(&bytes).map_err(|source| Error::CorruptJson {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(value))
}

/// Exclusive advisory lock over an entity directory.
///
/// The lock is held for the lifetime of the guard and released on every
/// exit path, including panics, via `Drop`. Never hold one across a
/// suspension point.
#[derive(Debug)]
pub struct EntityLock {
    file: File,
}

impl EntityLock {
    pub fn acquire(entity_dir: &Path) -> Result<Self> {
        fs::create_dir_all(entity_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(entity_dir.join(LOCK_FILE))?;
        file.lock()?;
        Ok(Self { file })
    }
}

impl Drop for EntityLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_name_rules() {
        assert!(valid_entity_name("users"));
        assert!(valid_entity_name("_private"));
        assert!(valid_entity_name("a1_b2"));
        assert!(!valid_entity_name(""));
        assert!(!valid_entity_name("1users"));
        assert!(!valid_entity_name("users-2"));
        assert!(!valid_entity_name("../etc"));
    }

    #[test]
    fn atomic_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.json");
        let doc = serde_json::json!({"id": 1, "name": "Alice"});
        atomic_write_json(&path, &doc).unwrap();
        assert_eq!(read_json(&path).unwrap(), Some(doc));
        // No temp file left behind.
        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_json(&dir.path().join("9.json")).unwrap().is_none());
    }
}
