use crate::file::Backing;
use crate::{check_key, StoreError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// In-memory [`Backing`] for tests and ephemeral engines.
///
/// `fail_next_write` arms a one-shot write failure so callers can
/// verify that a failed durable write leaves the in-memory index
/// untouched and publishes no event.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    fail_next: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_write(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn check_fail(&self) -> Result<(), StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::WriteFailed("injected write failure".to_owned()));
        }
        Ok(())
    }
}

impl Backing for MemoryStore {
    fn create(&self, prefix: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        self.check_fail()?;
        let mut map = self.data.lock().expect("memory store poisoned");
        let sub = map.entry(prefix.to_owned()).or_default();
        if sub.contains_key(key) {
            return Err(StoreError::already_exists(prefix, key));
        }
        sub.insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn update(&self, prefix: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        self.check_fail()?;
        let mut map = self.data.lock().expect("memory store poisoned");
        let sub = map.entry(prefix.to_owned()).or_default();
        if !sub.contains_key(key) {
            return Err(StoreError::not_found(prefix, key));
        }
        sub.insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn save(&self, prefix: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        self.check_fail()?;
        let mut map = self.data.lock().expect("memory store poisoned");
        map.entry(prefix.to_owned())
            .or_default()
            .insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn remove(&self, prefix: &str, key: &str) -> Result<(), StoreError> {
        check_key(key)?;
        let mut map = self.data.lock().expect("memory store poisoned");
        match map.get_mut(prefix).and_then(|sub| sub.remove(key)) {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found(prefix, key)),
        }
    }

    fn load(&self, prefix: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        check_key(key)?;
        let map = self.data.lock().expect("memory store poisoned");
        map.get(prefix)
            .and_then(|sub| sub.get(key))
            .cloned()
            .ok_or_else(|| StoreError::not_found(prefix, key))
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let map = self.data.lock().expect("memory store poisoned");
        Ok(map
            .get(prefix)
            .map(|sub| sub.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_roundtrip() {
        let store = MemoryStore::new();
        store.create("tasks", "t1", b"{}").unwrap();
        assert_eq!(store.load("tasks", "t1").unwrap(), b"{}");
        assert_eq!(store.keys("tasks").unwrap(), vec!["t1"]);
        store.remove("tasks", "t1").unwrap();
        assert!(store.load("tasks", "t1").unwrap_err().is_not_found());
    }

    #[test]
    fn injected_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_next_write();
        assert!(store.create("tasks", "t1", b"{}").is_err());
        store.create("tasks", "t1", b"{}").unwrap();
    }

    #[test]
    fn failed_write_stores_nothing() {
        let store = MemoryStore::new();
        store.fail_next_write();
        let _ = store.save("tasks", "t1", b"{}");
        assert!(store.keys("tasks").unwrap().is_empty());
    }
}
