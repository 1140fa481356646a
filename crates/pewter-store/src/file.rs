use crate::layout::StoreLayout;
use crate::{check_key, fsync_dir, StoreError};
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;

/// Per-prefix durable key-value contract consumed by the engine's
/// caches.
///
/// `create` fails on an existing key, `update` on a missing one, and
/// `save` upserts. A successful write must be durable before the call
/// returns; the in-memory index above this layer is only mutated after
/// the write succeeds.
pub trait Backing: Send + Sync {
    fn create(&self, prefix: &str, key: &str, data: &[u8]) -> Result<(), StoreError>;
    fn update(&self, prefix: &str, key: &str, data: &[u8]) -> Result<(), StoreError>;
    fn save(&self, prefix: &str, key: &str, data: &[u8]) -> Result<(), StoreError>;
    fn remove(&self, prefix: &str, key: &str) -> Result<(), StoreError>;
    fn load(&self, prefix: &str, key: &str) -> Result<Vec<u8>, StoreError>;
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// File-backed [`Backing`]: one file per object under
/// `data/<prefix>/<key>`, written atomically via tempfile + rename +
/// parent-dir fsync.
pub struct FileStore {
    layout: StoreLayout,
}

impl FileStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn write(&self, prefix: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let dir = self.layout.prefix_dir(prefix);
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(key))
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }

    fn exists(&self, prefix: &str, key: &str) -> bool {
        self.layout.prefix_dir(prefix).join(key).exists()
    }
}

impl Backing for FileStore {
    fn create(&self, prefix: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        if self.exists(prefix, key) {
            return Err(StoreError::already_exists(prefix, key));
        }
        self.write(prefix, key, data)
    }

    fn update(&self, prefix: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        if !self.exists(prefix, key) {
            return Err(StoreError::not_found(prefix, key));
        }
        self.write(prefix, key, data)
    }

    fn save(&self, prefix: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        self.write(prefix, key, data)
    }

    fn remove(&self, prefix: &str, key: &str) -> Result<(), StoreError> {
        check_key(key)?;
        let path = self.layout.prefix_dir(prefix).join(key);
        if !path.exists() {
            return Err(StoreError::not_found(prefix, key));
        }
        fs::remove_file(path)?;
        fsync_dir(&self.layout.prefix_dir(prefix))?;
        Ok(())
    }

    fn load(&self, prefix: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        check_key(key)?;
        let path = self.layout.prefix_dir(prefix).join(key);
        if !path.exists() {
            return Err(StoreError::not_found(prefix, key));
        }
        Ok(fs::read(path)?)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.prefix_dir(prefix);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    keys.push(name.to_owned());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize(&["bootenvs"]).unwrap();
        (dir, FileStore::new(layout))
    }

    #[test]
    fn create_load_roundtrip() {
        let (_dir, store) = test_store();
        store.create("bootenvs", "ubuntu", b"{}").unwrap();
        assert_eq!(store.load("bootenvs", "ubuntu").unwrap(), b"{}");
    }

    #[test]
    fn create_existing_conflicts() {
        let (_dir, store) = test_store();
        store.create("bootenvs", "ubuntu", b"{}").unwrap();
        assert!(matches!(
            store.create("bootenvs", "ubuntu", b"{}"),
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn update_missing_fails() {
        let (_dir, store) = test_store();
        assert!(store.update("bootenvs", "ghost", b"{}").unwrap_err().is_not_found());
    }

    #[test]
    fn save_upserts() {
        let (_dir, store) = test_store();
        store.save("bootenvs", "ubuntu", b"a").unwrap();
        store.save("bootenvs", "ubuntu", b"b").unwrap();
        assert_eq!(store.load("bootenvs", "ubuntu").unwrap(), b"b");
    }

    #[test]
    fn remove_then_load_fails() {
        let (_dir, store) = test_store();
        store.create("bootenvs", "ubuntu", b"{}").unwrap();
        store.remove("bootenvs", "ubuntu").unwrap();
        assert!(store.load("bootenvs", "ubuntu").unwrap_err().is_not_found());
    }

    #[test]
    fn keys_sorted_and_skip_dotfiles() {
        let (dir, store) = test_store();
        store.create("bootenvs", "zeta", b"{}").unwrap();
        store.create("bootenvs", "alpha", b"{}").unwrap();
        fs::write(
            StoreLayout::new(dir.path()).prefix_dir("bootenvs").join(".stray"),
            b"x",
        )
        .unwrap();
        assert_eq!(store.keys("bootenvs").unwrap(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn traversal_keys_rejected() {
        let (_dir, store) = test_store();
        assert!(store.create("bootenvs", "../evil", b"{}").is_err());
        assert!(store.load("bootenvs", "").is_err());
    }

    #[test]
    fn keys_of_unknown_prefix_is_empty() {
        let (_dir, store) = test_store();
        assert!(store.keys("nonesuch").unwrap().is_empty());
    }
}
