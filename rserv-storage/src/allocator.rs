//! Per-entity monotonic id allocation.
//!
//! The allocator state is a decimal ASCII counter in `_next_id.txt`. The
//! next value is persisted before the current one is handed out, so a crash
//! between allocation and document creation can leave a gap but never a
//! duplicate.

use crate::fsio::{self, EntityLock};
use crate::{Error, NEXT_ID_FILE, Result};
use rserv_api::DocId;
use std::fs;
use std::path::Path;

/// Allocates the next id for the entity, taking the entity lock itself.
pub fn allocate(entity_dir: &Path) -> Result<DocId> {
    let _guard = EntityLock::acquire(entity_dir)?;
    allocate_locked(entity_dir)
}

/// Allocation step for callers that already hold the entity lock.
pub fn allocate_locked(entity_dir: &Path) -> Result<DocId> {
    let path = entity_dir.join(NEXT_ID_FILE);
    let current: DocId = match fs::read_to_string(&path) {
        Ok(text) => text
            .trim()
            .parse()
            .map_err(|_| Error::AllocatorCorrupt(path.clone()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 1,
        Err(e) => return Err(e.into()),
    };
    fsio::atomic_write(&path, format!("{}\n", current + 1).as_bytes())?;
    Ok(current)
}

/// Raises the counter past `id` after a caller-supplied-id write, so the
/// allocator never hands that id out again. Caller holds the entity lock.
pub fn reserve_through_locked(entity_dir: &Path, id: DocId) -> Result<()> {
    let path = entity_dir.join(NEXT_ID_FILE);
    let current: DocId = match fs::read_to_string(&path) {
        Ok(text) => text
            .trim()
            .parse()
            .map_err(|_| Error::AllocatorCorrupt(path.clone()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 1,
        Err(e) => return Err(e.into()),
    };
    if id >= current {
        fsio::atomic_write(&path, format!("{}\n", id + 1).as_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_monotonically_from_one() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(allocate(dir.path()).unwrap(), 1);
        assert_eq!(allocate(dir.path()).unwrap(), 2);
        assert_eq!(allocate(dir.path()).unwrap(), 3);
    }

    #[test]
    fn persisted_counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        allocate(dir.path()).unwrap();
        allocate(dir.path()).unwrap();
        let text = fs::read_to_string(dir.path().join(NEXT_ID_FILE)).unwrap();
        assert_eq!(text.trim(), "3");
        assert_eq!(allocate(dir.path()).unwrap(), 3);
    }

    #[test]
    fn corrupt_counter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(NEXT_ID_FILE), "not a number").unwrap();
        assert!(matches!(
            allocate(dir.path()),
            Err(Error::AllocatorCorrupt(_))
        ));
    }
}
