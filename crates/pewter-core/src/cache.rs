//! In-memory indexed cache over one prefix of the durable store.

use crate::index::Index;
use crate::models::Model;
use pewter_store::{Backing, StoreError};
use std::sync::Arc;

/// Which durable primitive a write maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    Save,
}

impl WriteOp {
    pub fn action(self) -> &'static str {
        match self {
            WriteOp::Create => "create",
            WriteOp::Update => "update",
            WriteOp::Save => "save",
        }
    }
}

/// The cached view of one prefix: a key-sorted [`Index`] plus the
/// durable sub-store behind it. Mutations write through to the backing
/// store first; a failed durable write leaves the index untouched.
pub struct CacheStore {
    prefix: &'static str,
    backing: Arc<dyn Backing>,
    index: Index,
}

impl CacheStore {
    pub fn new(prefix: &'static str, backing: Arc<dyn Backing>) -> Self {
        Self {
            prefix,
            backing,
            index: Index::new_keyed(),
        }
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn items(&self) -> &[Arc<Model>] {
        self.index.items()
    }

    pub fn find(&self, key: &str) -> Option<&Arc<Model>> {
        self.index.find_key(key)
    }

    pub fn count(&self) -> usize {
        self.index.count()
    }

    /// Persist then index. The object is serialized with its validation
    /// state cleared so transient errors never reach the durable store.
    pub fn add(&mut self, op: WriteOp, m: &Model) -> Result<(), StoreError> {
        self.write_backing(op, m)?;
        self.index.insert_keyed(m.clone());
        Ok(())
    }

    /// Remove from the durable store, then drop from the index.
    pub fn remove(&mut self, key: &str) -> Result<Option<Arc<Model>>, StoreError> {
        self.backing.remove(self.prefix, key)?;
        Ok(self.index.remove_keyed(key))
    }

    fn write_backing(&self, op: WriteOp, m: &Model) -> Result<(), StoreError> {
        let data = m.save_clean_bytes()?;
        let key = m.key();
        match op {
            WriteOp::Create => self.backing.create(self.prefix, &key, &data),
            WriteOp::Update => self.backing.update(self.prefix, &key, &data),
            WriteOp::Save => self.backing.save(self.prefix, &key, &data),
        }
    }

    /// Index an object without touching the backing store; used when
    /// hydrating caches from disk at startup and when revalidation
    /// refreshes in-memory state.
    pub(crate) fn load_unchecked(&mut self, m: Model) {
        self.index.insert_keyed(m);
    }
}
