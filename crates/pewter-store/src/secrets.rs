use crate::{check_key, fsync_dir, StoreError};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Flat file store for per-object key material, separate from the
/// object data tree. Values are small (32-byte private keys) and are
/// written atomically.
pub struct SecretsStore {
    dir: PathBuf,
}

impl SecretsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn save(&self, name: &str, value: &[u8]) -> Result<(), StoreError> {
        check_key(name)?;
        fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(value)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.dir.join(name))
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&self.dir)?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        check_key(name)?;
        let path = self.dir.join(name);
        if !path.exists() {
            return Err(StoreError::not_found("secrets", name));
        }
        Ok(fs::read(path)?)
    }

    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        check_key(name)?;
        let path = self.dir.join(name);
        if path.exists() {
            fs::remove_file(path)?;
            fsync_dir(&self.dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secrets() -> (tempfile::TempDir, SecretsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::new(dir.path().join("secrets"));
        (dir, store)
    }

    #[test]
    fn save_load_remove() {
        let (_dir, store) = test_secrets();
        let key = [7u8; 32];
        store.save("machines-abc", &key).unwrap();
        assert_eq!(store.load("machines-abc").unwrap(), key);
        store.remove("machines-abc").unwrap();
        assert!(store.load("machines-abc").unwrap_err().is_not_found());
    }

    #[test]
    fn remove_missing_is_ok() {
        let (_dir, store) = test_secrets();
        assert!(store.remove("never-existed").is_ok());
    }

    #[test]
    fn load_missing_is_not_found() {
        let (_dir, store) = test_secrets();
        assert!(store.load("ghost").unwrap_err().is_not_found());
    }
}
