use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app::ports::SnapshotStore;
use crate::error::StoreError;
use crate::types::RawSnapshot;

/// Append-only snapshot store rooted at a directory. Keys map to relative
/// paths; writes go to a private temp file first and are linked into place.
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid snapshot key '{}'", key),
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));
        fs::write(&tmp, bytes).await?;

        // Linking fails if the key is taken, so a stored snapshot is never replaced.
        let linked = fs::hard_link(&tmp, &path).await;
        if let Err(e) = fs::remove_file(&tmp).await {
            warn!(path = %tmp.display(), error = %e, "could not remove temp file");
        }
        match linked {
            Ok(()) => {
                debug!(path = %path.display(), bytes = bytes.len(), "snapshot written");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StoreError::AlreadyExists(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists keys in the directory named by `prefix` (up to its last `/`)
    /// whose file name starts with the remainder. Not recursive.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let (dir_part, name_prefix) = match prefix.rfind('/') {
            Some(idx) => (&prefix[..=idx], &prefix[idx + 1..]),
            None => ("", prefix),
        };
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir_part.trim_end_matches('/'))?
        };

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(name_prefix) && !name.starts_with('.') && !name.ends_with(".tmp") {
                keys.push(format!("{}{}", dir_part, name));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Serialize and persist one snapshot under its store key
pub async fn persist_snapshot(store: &dyn SnapshotStore, snapshot: &RawSnapshot) -> Result<String, StoreError> {
    let key = snapshot.store_key();
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    store.write(&key, &bytes).await?;
    Ok(key)
}

/// Read back every snapshot under `prefix`, in key order. Entries that fail
/// to decode are skipped with a warning.
pub async fn load_snapshots(store: &dyn SnapshotStore, prefix: &str) -> Result<Vec<RawSnapshot>, StoreError> {
    let mut snapshots = Vec::new();
    for key in store.list(prefix).await? {
        let bytes = store.read(&key).await?;
        match serde_json::from_slice::<RawSnapshot>(&bytes) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => warn!(key = %key, error = %e, "skipping unreadable snapshot"),
        }
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceKind;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_fs_store_round_trips_snapshots() {
        let dir = tempdir().unwrap();
        let store = FsSnapshotStore::new(dir.path());
        let snapshot = RawSnapshot::new("Delhi", SourceKind::Primary, Utc::now(), json!({"results": []}));

        let key = persist_snapshot(&store, &snapshot).await.unwrap();
        assert!(key.starts_with("raw/delhi_raw_"));
        assert!(dir.path().join(&key).exists());

        store.write("raw/garbage.json", b"not json").await.unwrap();

        let loaded = load_snapshots(&store, "raw/").await.unwrap();
        assert_eq!(loaded, vec![snapshot]);
    }

    #[tokio::test]
    async fn test_fs_store_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let store = FsSnapshotStore::new(dir.path());
        store.write("raw/a.json", b"first").await.unwrap();

        let err = store.write("raw/a.json", b"second").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.read("raw/a.json").await.unwrap(), b"first");
        assert_eq!(store.list("raw/").await.unwrap(), vec!["raw/a.json"]);
    }

    #[tokio::test]
    async fn test_lookalike_entities_keep_separate_snapshots() {
        let dir = tempdir().unwrap();
        let store = FsSnapshotStore::new(dir.path());
        let fetched_at = Utc::now();
        for key in ["Delhi", "delhi", "New Delhi", "new_delhi"] {
            let snapshot = RawSnapshot::new(key, SourceKind::Primary, fetched_at, json!({"results": []}));
            persist_snapshot(&store, &snapshot).await.unwrap();
        }

        let loaded = load_snapshots(&store, "raw/").await.unwrap();
        let mut entities: Vec<&str> = loaded.iter().map(|s| s.entity_key.as_str()).collect();
        entities.sort_unstable();
        assert_eq!(entities, vec!["Delhi", "New Delhi", "delhi", "new_delhi"]);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = tempdir().unwrap();
        let store = FsSnapshotStore::new(dir.path());
        assert!(store.write("../outside.json", b"{}").await.is_err());
        assert!(store.write("/abs.json", b"{}").await.is_err());
    }

    #[tokio::test]
    async fn test_fs_store_lists_nothing_for_missing_dir() {
        let dir = tempdir().unwrap();
        let store = FsSnapshotStore::new(dir.path());
        assert!(store.list("raw/").await.unwrap().is_empty());
        assert!(matches!(store.read("raw/nope.json").await, Err(StoreError::NotFound(_))));
    }
}
