//! Ordered, queryable views over the objects of one prefix.
//!
//! An [`Index`] is an immutable sorted sequence of shared model
//! references. Named [`Maker`]s declare how a prefix can be indexed:
//! whether the index is unique, the semantic kind of the key, how to
//! extract an ordering key from a model, and how to build a skeleton
//! model from a key string (which doubles as key-format validation).
//! All filters are pure: they return a new `Index` and never disturb
//! the one they were called on, so iteration over any view is stable.

use crate::models::Model;
use pewter_schema::ApiError;
use std::cmp::Ordering;
use std::sync::Arc;

/// Declaration of one way to index a prefix.
pub struct Maker {
    pub name: &'static str,
    pub unique: bool,
    /// Semantic kind of the key: `"string"`, `"boolean"`, `"uuid"`.
    pub kind: &'static str,
    /// Extract the ordering key. String ordering is total for every
    /// kind the engine indexes on.
    pub key_of: fn(&Model) -> String,
    /// Build a skeleton model carrying only the indexed field; fails
    /// when the key string is not valid for this index's kind.
    pub fill: fn(&str) -> Result<Model, ApiError>,
}

impl Maker {
    pub fn cmp(&self, a: &Model, b: &Model) -> Ordering {
        (self.key_of)(a).cmp(&(self.key_of)(b))
    }
}

/// A sorted view over models of one prefix.
#[derive(Clone, Default)]
pub struct Index {
    objs: Vec<Arc<Model>>,
    sorted_by: Option<&'static str>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<Arc<Model>>, sorted_by: Option<&'static str>) -> Self {
        Self {
            objs: items,
            sorted_by,
        }
    }

    pub fn items(&self) -> &[Arc<Model>] {
        &self.objs
    }

    pub fn count(&self) -> usize {
        self.objs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    /// Re-sort the view by the given maker. Stable, so equal keys keep
    /// their relative order.
    pub fn sort(&self, maker: &Maker) -> Index {
        let mut objs = self.objs.clone();
        objs.sort_by(|a, b| maker.cmp(a, b));
        Index {
            objs,
            sorted_by: Some(maker.name),
        }
    }

    fn require_sorted(&self, maker: &Maker) -> Result<(), ApiError> {
        if self.sorted_by != Some(maker.name) {
            return Err(ApiError::internal(
                "index",
                maker.name,
                format!("index is not sorted by {}", maker.name),
            ));
        }
        Ok(())
    }

    /// First position whose key is >= `key`.
    fn lower(&self, maker: &Maker, key: &str) -> usize {
        self.objs.partition_point(|o| (maker.key_of)(o).as_str() < key)
    }

    /// First position whose key is > `key`.
    fn upper(&self, maker: &Maker, key: &str) -> usize {
        self.objs.partition_point(|o| (maker.key_of)(o).as_str() <= key)
    }

    fn slice(&self, range: std::ops::Range<usize>, sorted_by: Option<&'static str>) -> Index {
        Index {
            objs: self.objs[range].to_vec(),
            sorted_by,
        }
    }

    pub fn eq(&self, maker: &Maker, key: &str) -> Result<Index, ApiError> {
        self.require_sorted(maker)?;
        let lo = self.lower(maker, key);
        let hi = self.upper(maker, key);
        Ok(self.slice(lo..hi, self.sorted_by))
    }

    pub fn lt(&self, maker: &Maker, key: &str) -> Result<Index, ApiError> {
        self.require_sorted(maker)?;
        let lo = self.lower(maker, key);
        Ok(self.slice(0..lo, self.sorted_by))
    }

    pub fn lte(&self, maker: &Maker, key: &str) -> Result<Index, ApiError> {
        self.require_sorted(maker)?;
        let hi = self.upper(maker, key);
        Ok(self.slice(0..hi, self.sorted_by))
    }

    pub fn gt(&self, maker: &Maker, key: &str) -> Result<Index, ApiError> {
        self.require_sorted(maker)?;
        let hi = self.upper(maker, key);
        Ok(self.slice(hi..self.objs.len(), self.sorted_by))
    }

    pub fn gte(&self, maker: &Maker, key: &str) -> Result<Index, ApiError> {
        self.require_sorted(maker)?;
        let lo = self.lower(maker, key);
        Ok(self.slice(lo..self.objs.len(), self.sorted_by))
    }

    pub fn between(&self, maker: &Maker, low: &str, high: &str) -> Result<Index, ApiError> {
        self.require_sorted(maker)?;
        let lo = self.lower(maker, low);
        let hi = self.upper(maker, high).max(lo);
        Ok(self.slice(lo..hi, self.sorted_by))
    }

    /// Everything outside `[low, high]`.
    pub fn except(&self, maker: &Maker, low: &str, high: &str) -> Result<Index, ApiError> {
        self.require_sorted(maker)?;
        let lo = self.lower(maker, low);
        let hi = self.upper(maker, high).max(lo);
        let mut objs = self.objs[0..lo].to_vec();
        objs.extend_from_slice(&self.objs[hi..]);
        Ok(Index {
            objs,
            sorted_by: self.sorted_by,
        })
    }

    pub fn offset(&self, n: usize) -> Index {
        let n = n.min(self.objs.len());
        self.slice(n..self.objs.len(), self.sorted_by)
    }

    pub fn limit(&self, n: usize) -> Index {
        let n = n.min(self.objs.len());
        self.slice(0..n, self.sorted_by)
    }

    /// Look up a single object in a unique index.
    pub fn find(&self, maker: &Maker, key: &str) -> Result<Option<Arc<Model>>, ApiError> {
        self.require_sorted(maker)?;
        if !maker.unique {
            return Err(ApiError::internal(
                "index",
                maker.name,
                format!("index {} is not unique", maker.name),
            ));
        }
        let lo = self.lower(maker, key);
        Ok(self
            .objs
            .get(lo)
            .filter(|o| (maker.key_of)(o) == key)
            .cloned())
    }

    // Key-ordered maintenance used by the cache stores. The base index
    // is always sorted by Key.

    pub(crate) fn new_keyed() -> Self {
        Index {
            objs: Vec::new(),
            sorted_by: Some("Key"),
        }
    }

    pub(crate) fn insert_keyed(&mut self, m: Model) {
        let key = m.key();
        let pos = self.objs.partition_point(|o| o.key() < key);
        if self.objs.get(pos).is_some_and(|o| o.key() == key) {
            self.objs[pos] = Arc::new(m);
        } else {
            self.objs.insert(pos, Arc::new(m));
        }
    }

    pub(crate) fn remove_keyed(&mut self, key: &str) -> Option<Arc<Model>> {
        let pos = self.objs.partition_point(|o| o.key().as_str() < key);
        if self.objs.get(pos).map(|o| o.key()).as_deref() == Some(key) {
            Some(self.objs.remove(pos))
        } else {
            None
        }
    }

    pub(crate) fn find_key(&self, key: &str) -> Option<&Arc<Model>> {
        let pos = self.objs.partition_point(|o| o.key().as_str() < key);
        self.objs.get(pos).filter(|o| o.key() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::makers_for;
    use pewter_schema::BootEnv;

    fn env(name: &str, os: &str) -> Model {
        Model::BootEnv(BootEnv {
            name: name.to_owned(),
            os: pewter_schema::OsInfo {
                name: os.to_owned(),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn test_index() -> Index {
        let mut idx = Index::new_keyed();
        for (n, os) in [
            ("centos-8", "centos"),
            ("ubuntu-20.04", "ubuntu"),
            ("debian-11", "debian"),
            ("ubuntu-22.04", "ubuntu"),
        ] {
            idx.insert_keyed(env(n, os));
        }
        idx
    }

    fn maker(name: &str) -> Maker {
        makers_for("bootenvs")
            .into_iter()
            .find(|m| m.name == name)
            .unwrap()
    }

    #[test]
    fn keyed_insert_keeps_sorted_unique() {
        let mut idx = test_index();
        idx.insert_keyed(env("ubuntu-20.04", "ubuntu"));
        assert_eq!(idx.count(), 4);
        let keys: Vec<String> = idx.items().iter().map(|o| o.key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn eq_selects_matching_range() {
        let idx = test_index();
        let by_os = maker("OsName");
        let ubuntus = idx.sort(&by_os).eq(&by_os, "ubuntu").unwrap();
        assert_eq!(ubuntus.count(), 2);
    }

    #[test]
    fn range_filters_partition() {
        let idx = test_index();
        let by_name = maker("Name");
        let sorted = idx.sort(&by_name);
        let lt = sorted.lt(&by_name, "debian-11").unwrap();
        let gte = sorted.gte(&by_name, "debian-11").unwrap();
        assert_eq!(lt.count() + gte.count(), idx.count());
        assert_eq!(lt.count(), 1);
    }

    #[test]
    fn between_and_except_are_complements() {
        let idx = test_index();
        let by_name = maker("Name");
        let sorted = idx.sort(&by_name);
        let inside = sorted.between(&by_name, "debian-11", "ubuntu-20.04").unwrap();
        let outside = sorted.except(&by_name, "debian-11", "ubuntu-20.04").unwrap();
        assert_eq!(inside.count() + outside.count(), idx.count());
        assert_eq!(inside.count(), 2);
    }

    #[test]
    fn find_on_unique_index() {
        let idx = test_index();
        let by_name = maker("Name");
        let sorted = idx.sort(&by_name);
        let hit = sorted.find(&by_name, "debian-11").unwrap();
        assert!(hit.is_some());
        assert!(sorted.find(&by_name, "slackware").unwrap().is_none());
    }

    #[test]
    fn find_on_non_unique_index_fails() {
        let idx = test_index();
        let by_os = maker("OsName");
        assert!(idx.sort(&by_os).find(&by_os, "ubuntu").is_err());
    }

    #[test]
    fn unsorted_filter_is_rejected() {
        let idx = test_index();
        let by_os = maker("OsName");
        assert!(idx.eq(&by_os, "ubuntu").is_err());
    }

    #[test]
    fn filters_do_not_disturb_source() {
        let idx = test_index();
        let by_name = maker("Name");
        let before: Vec<String> = idx.items().iter().map(|o| o.key()).collect();
        let _ = idx.sort(&by_name).lt(&by_name, "ubuntu-20.04").unwrap();
        let after: Vec<String> = idx.items().iter().map(|o| o.key()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn offset_and_limit() {
        let idx = test_index();
        assert_eq!(idx.offset(1).count(), 3);
        assert_eq!(idx.limit(2).count(), 2);
        assert_eq!(idx.offset(10).count(), 0);
    }

    #[test]
    fn remove_keyed_returns_removed() {
        let mut idx = test_index();
        assert!(idx.remove_keyed("centos-8").is_some());
        assert!(idx.remove_keyed("centos-8").is_none());
        assert_eq!(idx.count(), 3);
    }
}
