//! The transaction-like request scope.
//!
//! A [`RequestTracker`] is built from the DataTracker with a declared
//! lock set. [`RequestTracker::do_with`] acquires those locks in
//! canonical order and hands the caller a [`Tx`] carrying the CRUD
//! surface. After the closure returns and every lock has been
//! released, the post-commit queue drains in FIFO order: events,
//! renderer (de)registration, dynamic-tree changes, and ISO explosion.

use crate::cache::WriteOp;
use crate::data_tracker::{DataTracker, Stores};
use crate::events::Event;
use crate::fs::Lookaside;
use crate::iso::IsoTask;
use crate::models::{self, Model};
use crate::render::Renderer;
use crate::CoreError;
use pewter_schema::{kind, ApiError, SecureData};
use pewter_store::StoreError;
use std::collections::BTreeMap;
use tracing::debug;
use zeroize::Zeroizing;

/// One queued post-commit side effect.
pub(crate) enum AfterAction {
    Event(Event),
    Register(Vec<Renderer>),
    Deregister(Vec<String>),
    AddTree(String, Lookaside),
    DelTree(String),
    ExplodeIsos(Vec<IsoTask>),
    Thunk(Box<dyn FnOnce(&DataTracker) + Send>),
}

/// Tracks a single request against the DataTracker; the closest thing
/// to a transaction the engine has.
pub struct RequestTracker<'a> {
    dt: &'a DataTracker,
    locks: Vec<&'static str>,
    principal: String,
    in_do: bool,
}

impl<'a> RequestTracker<'a> {
    pub(crate) fn new(dt: &'a DataTracker, locks: &[&'static str]) -> Self {
        Self {
            dt,
            locks: locks.to_vec(),
            principal: String::new(),
            in_do: false,
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    pub fn dt(&self) -> &'a DataTracker {
        self.dt
    }

    /// Run `thunk` with the declared locks held. Re-entering panics:
    /// that is a programmer error, not a recoverable condition.
    pub fn do_with<R>(&mut self, thunk: impl FnOnce(&mut Tx<'a>) -> R) -> R {
        let stores = self.dt.lock_prefixes(&self.locks);
        self.run(stores, thunk)
    }

    /// Like [`do_with`](Self::do_with), but with every prefix locked.
    pub fn all_locked<R>(&mut self, thunk: impl FnOnce(&mut Tx<'a>) -> R) -> R {
        let stores = self.dt.lock_all();
        self.run(stores, thunk)
    }

    fn run<R>(&mut self, stores: Stores<'a>, thunk: impl FnOnce(&mut Tx<'a>) -> R) -> R {
        if self.in_do {
            panic!("recursive lock of request tracker");
        }
        self.in_do = true;
        let mut tx = Tx {
            dt: self.dt,
            stores,
            after: Vec::new(),
            principal: self.principal.clone(),
        };
        let res = thunk(&mut tx);
        let Tx { after, stores, .. } = tx;
        // Locks release here, before any side effect runs.
        drop(stores);
        self.in_do = false;
        self.dt.run_actions(after);
        res
    }

    /// Deliver an event immediately; only valid outside `do_with`,
    /// where no locks are held.
    pub fn publish(&self, prefix: &str, action: &str, key: &str, payload: &Model) {
        let object = payload.to_json_value();
        self.dt
            .publishers()
            .publish(&Event::new(prefix, action, key, &self.principal, object));
    }

    pub fn publish_event(&self, event: Event) {
        self.dt.publishers().publish(&event);
    }

    /// The object's 32-byte private key, minted and persisted on first
    /// use. The returned buffer is wiped on drop.
    pub fn private_key_for(&self, m: &Model) -> Result<Zeroizing<Vec<u8>>, CoreError> {
        self.dt.private_key_for(m.prefix(), &m.key())
    }

    /// Curve25519 scalar-base-mult of the stored private key.
    pub fn public_key_for(&self, m: &Model) -> Result<Vec<u8>, CoreError> {
        let private = self.private_key_for(m)?;
        Ok(pewter_schema::secure::public_key_for(&private)?.to_vec())
    }

    pub fn delete_key_for(&self, m: &Model) -> Result<(), CoreError> {
        self.dt.delete_key_for(m.prefix(), &m.key())
    }
}

/// The in-transaction handle: store access, CRUD, parameter
/// resolution, and the post-commit queue.
pub struct Tx<'a> {
    dt: &'a DataTracker,
    pub(crate) stores: Stores<'a>,
    pub(crate) after: Vec<AfterAction>,
    principal: String,
}

fn store_api_err(e: StoreError, prefix: &str, key: &str) -> ApiError {
    match e {
        StoreError::AlreadyExists { .. } => ApiError::conflict(prefix, key),
        StoreError::NotFound { .. } => ApiError::not_found(prefix, key),
        StoreError::InvalidKey(k) => {
            ApiError::bad_request(prefix, key, format!("invalid key: {k}"))
        }
        other => ApiError::internal(prefix, key, other.to_string()),
    }
}

impl<'a> Tx<'a> {
    pub fn dt(&self) -> &'a DataTracker {
        self.dt
    }

    /// The locked cache store for a prefix. Asking for a prefix outside
    /// the declared lock set is a programmer error and panics.
    pub fn store(&self, prefix: &str) -> &crate::cache::CacheStore {
        self.stores
            .get(prefix)
            .unwrap_or_else(|| panic!("missing requested lock for {prefix}"))
    }

    fn store_mut(&mut self, prefix: &str) -> &mut crate::cache::CacheStore {
        self.stores
            .get_mut(prefix)
            .unwrap_or_else(|| panic!("missing requested lock for {prefix}"))
    }

    /// Replace an object's cached (in-memory) state without touching
    /// the backing store; used by revalidation cascades.
    pub(crate) fn replace_cached(&mut self, prefix: &str, m: Model) {
        self.store_mut(prefix).load_unchecked(m);
    }

    /// Look up a live cached object. `Index:key` syntax searches the
    /// named unique index instead of the primary key.
    pub fn raw_find(&self, prefix: &str, key: &str) -> Option<std::sync::Arc<Model>> {
        let store = self.store(prefix);
        if let Some((idx_name, real_key)) = key.split_once(':') {
            let makers = models::makers_for(prefix);
            if let Some(maker) = makers.iter().find(|m| m.name == idx_name && m.unique) {
                let sorted = store.index().sort(maker);
                return sorted.find(maker, real_key).ok().flatten();
            }
        }
        store.find(key).cloned()
    }

    /// Like [`raw_find`](Self::raw_find), but returns a deep clone the
    /// caller may mutate freely.
    pub fn find(&self, prefix: &str, key: &str) -> Option<Model> {
        self.raw_find(prefix, key).map(|a| (*a).clone())
    }

    /// Look up through an arbitrary declared index. The key is
    /// validated against the index's kind first.
    pub fn find_by_index(
        &self,
        prefix: &str,
        index_name: &str,
        key: &str,
    ) -> Result<Option<Model>, ApiError> {
        let makers = models::makers_for(prefix);
        let maker = makers
            .iter()
            .find(|m| m.name == index_name)
            .ok_or_else(|| {
                ApiError::bad_request(prefix, key, format!("no index named {index_name}"))
            })?;
        (maker.fill)(key)?;
        let sorted = self.store(prefix).index().sort(maker);
        Ok(sorted.find(maker, key)?.map(|a| (*a).clone()))
    }

    pub fn machine_for_mac(&self, mac: &str) -> Option<Model> {
        self.store("machines")
            .items()
            .iter()
            .find(|o| match &***o {
                Model::Machine(m) => m.has_mac(mac),
                _ => false,
            })
            .map(|a| (**a).clone())
    }

    pub fn prefs(&self) -> BTreeMap<String, String> {
        self.dt.prefs()
    }

    pub fn pref(&self, name: &str) -> Option<String> {
        self.dt.pref(name)
    }

    /// Queue a post-commit thunk; runs after every lock releases, in
    /// enqueue order.
    pub fn run_after(&mut self, f: impl FnOnce(&DataTracker) + Send + 'static) {
        self.after.push(AfterAction::Thunk(Box::new(f)));
    }

    /// Queue an event for delivery after the locks release. The payload
    /// is cloned now so later mutations do not leak into subscribers.
    pub fn publish(&mut self, prefix: &str, action: &str, key: &str, payload: &Model) {
        let object = payload.to_json_value();
        self.after.push(AfterAction::Event(Event::new(
            prefix,
            action,
            key,
            &self.principal,
            object,
        )));
    }

    pub fn publish_event(&mut self, event: Event) {
        self.after.push(AfterAction::Event(event));
    }

    fn queue_event(&mut self, prefix: &str, action: &str, key: &str, payload: &Model) {
        self.publish(prefix, action, key, payload);
    }

    // --- CRUD ---

    pub fn create(&mut self, obj: Model) -> Result<Model, ApiError> {
        self.commit(WriteOp::Create, obj)
    }

    pub fn update(&mut self, obj: Model) -> Result<Model, ApiError> {
        self.commit(WriteOp::Update, obj)
    }

    pub fn save(&mut self, obj: Model) -> Result<Model, ApiError> {
        self.commit(WriteOp::Save, obj)
    }

    fn commit(&mut self, op: WriteOp, mut obj: Model) -> Result<Model, ApiError> {
        obj.fill();
        let prefix = obj.prefix();
        let key = obj.key();
        if key.is_empty() {
            return Err(ApiError::bad_request(prefix, "", "empty key not allowed"));
        }
        let exists = self.store(prefix).find(&key).is_some();
        match op {
            WriteOp::Create if exists => return Err(ApiError::conflict(prefix, &key)),
            WriteOp::Update if !exists => return Err(ApiError::not_found(prefix, &key)),
            _ => {}
        }
        obj.clear_validation();
        let fx = models::validate(self, &mut obj);
        models::before_save(&mut obj);
        if !models::save_level_ok(&obj) {
            return Err(ApiError::validation(
                prefix,
                &key,
                &obj.validation().errors,
            ));
        }
        // Write through to the backing store, then index, then run the
        // save hooks so cascades observe the new state.
        self.store_mut(prefix)
            .add(op, &obj)
            .map_err(|e| store_api_err(e, prefix, &key))?;
        models::after_save(self, &obj, fx);
        self.queue_event(prefix, op.action(), &key, &obj);
        Ok(obj)
    }

    /// Remove the object named by the (possibly partial) skeleton.
    pub fn remove(&mut self, skeleton: &Model) -> Result<Model, ApiError> {
        let prefix = skeleton.prefix();
        let key = skeleton.key();
        if key.is_empty() {
            return Err(ApiError::bad_request(prefix, "", "empty key not allowed"));
        }
        let existing = match self.store(prefix).find(&key) {
            Some(o) => (**o).clone(),
            None => return Err(ApiError::not_found(prefix, &key)),
        };
        models::before_delete(self, &existing)?;
        let _ = self
            .store_mut(prefix)
            .remove(&key)
            .map_err(|e| store_api_err(e, prefix, &key))?;
        models::after_delete(self, &existing);
        self.queue_event(prefix, "delete", &key, &existing);
        Ok(existing)
    }

    /// Apply a JSON patch to the object at `key`. Ops apply one at a
    /// time; the first failure reports its op index and the op itself,
    /// and leaves the stored object untouched.
    pub fn patch(
        &mut self,
        skeleton: &Model,
        key: &str,
        ops: &json_patch::Patch,
    ) -> Result<Model, ApiError> {
        let prefix = skeleton.prefix();
        let existing = match self.store(prefix).find(key) {
            Some(o) => (**o).clone(),
            None => return Err(ApiError::not_found(prefix, key)),
        };
        let mut doc = existing
            .save_clean_value()
            .map_err(|e| ApiError::internal(prefix, key, e.to_string()))?;
        debug!("patching {prefix}:{key}");
        for (i, op) in ops.0.iter().enumerate() {
            if let Err(e) = json_patch::patch(&mut doc, std::slice::from_ref(op)) {
                let mut err = ApiError::new(409, kind::PATCH, prefix, key);
                err.errorf(format!("patch error at op {i}: {e}"));
                err.errorf(format!(
                    "patch op: {}",
                    serde_json::to_string(op).unwrap_or_default()
                ));
                return Err(err);
            }
        }
        let mut to_save = Model::from_json_value(prefix, doc).map_err(|e| {
            ApiError::bad_request(prefix, key, format!("patch produced invalid object: {e}"))
        })?;
        if skeleton.validation().change_forced() {
            to_save.validation_mut().force_change();
        }
        self.commit(WriteOp::Update, to_save)
    }

    // --- Parameter resolution ---

    /// Own params plus, when aggregating, profile / stage-profile /
    /// global-profile params in first-wins order. Sources are tracked
    /// per key so decryption uses the key pair of the object that
    /// stored the ciphertext.
    fn agg_params(
        &self,
        m: &Model,
        aggregate: bool,
    ) -> (
        BTreeMap<String, serde_json::Value>,
        BTreeMap<String, (String, String)>,
    ) {
        let mut params = m.params().cloned().unwrap_or_default();
        let mut sources: BTreeMap<String, (String, String)> = params
            .keys()
            .map(|k| (k.clone(), (m.prefix().to_owned(), m.key())))
            .collect();
        if !aggregate {
            return (params, sources);
        }

        let mut subs: Vec<std::sync::Arc<Model>> = Vec::new();
        if let Model::Machine(mach) = m {
            for p in &mach.profiles {
                if let Some(o) = self.raw_find("profiles", p) {
                    subs.push(o);
                }
            }
            if !mach.stage.is_empty() {
                if let Some(st) = self.raw_find("stages", &mach.stage) {
                    if let Model::Stage(stage) = &*st {
                        for p in &stage.profiles {
                            if let Some(o) = self.raw_find("profiles", p) {
                                subs.push(o);
                            }
                        }
                    }
                }
            }
        }
        if let Some(global) = self.raw_find("profiles", self.dt.global_profile()) {
            subs.push(global);
        }

        for sub in subs {
            if let Some(sub_params) = sub.params() {
                for (k, v) in sub_params {
                    if !params.contains_key(k) {
                        params.insert(k.clone(), v.clone());
                        sources.insert(k.clone(), (sub.prefix().to_owned(), sub.key()));
                    }
                }
            }
        }
        (params, sources)
    }

    fn decrypt_param(
        &self,
        source: &(String, String),
        name: &str,
        val: serde_json::Value,
    ) -> serde_json::Value {
        let Some(pdef) = self.raw_find("params", name) else {
            return val;
        };
        let Model::Param(param) = &*pdef else {
            return val;
        };
        if !param.secure {
            return val;
        }
        let envelope: SecureData = match serde_json::from_value(val.clone()) {
            Ok(sd) => sd,
            Err(_) => return val,
        };
        let private = match self.dt.private_key_for(&source.0, &source.1) {
            Ok(k) => k,
            Err(e) => {
                debug!("no key for {}:{}: {e}", source.0, source.1);
                return val;
            }
        };
        envelope.open(&private).unwrap_or(val)
    }

    pub fn get_params(
        &self,
        m: &Model,
        aggregate: bool,
        decrypt: bool,
    ) -> BTreeMap<String, serde_json::Value> {
        let (mut params, sources) = self.agg_params(m, aggregate);
        if decrypt {
            for (k, source) in &sources {
                if let Some(v) = params.remove(k) {
                    params.insert(k.clone(), self.decrypt_param(source, k, v));
                }
            }
        }
        params
    }

    /// Resolve one key; when aggregating, falls back to the param
    /// definition's declared default.
    pub fn get_param(
        &self,
        m: &Model,
        key: &str,
        aggregate: bool,
        decrypt: bool,
    ) -> Option<serde_json::Value> {
        let (params, sources) = self.agg_params(m, aggregate);
        if let Some(v) = params.get(key) {
            return Some(if decrypt {
                self.decrypt_param(&sources[key], key, v.clone())
            } else {
                v.clone()
            });
        }
        if aggregate {
            if let Some(pdef) = self.raw_find("params", key) {
                if let Model::Param(param) = &*pdef {
                    debug!("param {key} not set, falling back to default");
                    return param.default_value();
                }
            }
        }
        None
    }

    /// The source-tracked param lookup used by secure round trips:
    /// which object's key pair protects `key` for `m`.
    pub fn param_source(&self, m: &Model, key: &str) -> Option<(String, String)> {
        let (_, sources) = self.agg_params(m, true);
        sources.get(key).cloned()
    }
}
