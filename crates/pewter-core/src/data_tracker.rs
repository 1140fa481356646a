//! The root registry: every cache store, the lock manager, preferences,
//! secrets, publishers, the shared template root, and the serving FS.

use crate::cache::CacheStore;
use crate::events::Publishers;
use crate::fs::FileSystem;
use crate::models::{self, Model};
use crate::request_tracker::{AfterAction, RequestTracker};
use crate::{iso, CoreError, GLOBAL_PROFILE, PREFIXES};
use pewter_store::{Backing, FileStore, SecretsStore, StoreLayout, StoreLock};
use rand::RngCore;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Construction parameters for a [`DataTracker`].
pub struct DtConfig {
    pub backing: Arc<dyn Backing>,
    pub secrets: SecretsStore,
    pub file_root: PathBuf,
    pub global_profile: String,
}

impl DtConfig {
    pub fn new(
        backing: Arc<dyn Backing>,
        secrets: SecretsStore,
        file_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backing,
            secrets,
            file_root: file_root.into(),
            global_profile: GLOBAL_PROFILE.to_owned(),
        }
    }
}

/// The set of prefix locks held by one transaction, in canonical
/// acquisition order.
pub struct Stores<'a> {
    held: Vec<(&'static str, MutexGuard<'a, CacheStore>)>,
}

impl Stores<'_> {
    pub fn get(&self, prefix: &str) -> Option<&CacheStore> {
        self.held
            .iter()
            .find(|(p, _)| *p == prefix)
            .map(|(_, g)| &**g)
    }

    pub fn get_mut(&mut self, prefix: &str) -> Option<&mut CacheStore> {
        self.held
            .iter_mut()
            .find(|(p, _)| *p == prefix)
            .map(|(_, g)| &mut **g)
    }

    pub fn prefixes(&self) -> Vec<&'static str> {
        self.held.iter().map(|(p, _)| *p).collect()
    }
}

/// Root object owning all engine state. One per process; request
/// handling happens through [`RequestTracker`]s built from it.
pub struct DataTracker {
    stores: BTreeMap<&'static str, Mutex<CacheStore>>,
    secrets: Mutex<SecretsStore>,
    publishers: Publishers,
    fs: Arc<FileSystem>,
    file_root: PathBuf,
    global_profile: String,
    prefs: Mutex<BTreeMap<String, String>>,
    tmpl_root: Mutex<Arc<BTreeMap<String, String>>>,
    /// At most one ISO extraction runs at a time, engine-wide.
    extract: Mutex<()>,
    _store_lock: Option<StoreLock>,
}

impl DataTracker {
    /// Build an engine over an arbitrary backing store, hydrate every
    /// cache, and run the initial full revalidation pass.
    pub fn new(cfg: DtConfig) -> Result<Self, CoreError> {
        Self::build(cfg, None)
    }

    /// Production path: file-backed stores under `layout`, guarded by
    /// the store's advisory lock.
    pub fn open(layout: StoreLayout, file_root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        layout.initialize(PREFIXES)?;
        let lock = StoreLock::acquire(&layout.lock_file())?;
        let secrets = SecretsStore::new(layout.secrets_dir());
        let backing: Arc<dyn Backing> = Arc::new(FileStore::new(layout));
        Self::build(DtConfig::new(backing, secrets, file_root), Some(lock))
    }

    fn build(cfg: DtConfig, store_lock: Option<StoreLock>) -> Result<Self, CoreError> {
        let mut stores = BTreeMap::new();
        for prefix in PREFIXES {
            stores.insert(
                *prefix,
                Mutex::new(CacheStore::new(*prefix, cfg.backing.clone())),
            );
        }
        let dt = Self {
            stores,
            secrets: Mutex::new(cfg.secrets),
            publishers: Publishers::new(),
            fs: Arc::new(FileSystem::new(cfg.file_root.clone())),
            file_root: cfg.file_root,
            global_profile: cfg.global_profile,
            prefs: Mutex::new(BTreeMap::new()),
            tmpl_root: Mutex::new(Arc::new(BTreeMap::new())),
            extract: Mutex::new(()),
            _store_lock: store_lock,
        };
        dt.load_all(&cfg.backing)?;
        Ok(dt)
    }

    /// Hydrate every cache from the backing store, then revalidate all
    /// objects in dependency order so cross-object state is coherent
    /// before the first request.
    fn load_all(&self, backing: &Arc<dyn Backing>) -> Result<(), CoreError> {
        for prefix in PREFIXES {
            let keys = backing.keys(prefix)?;
            let mut store = self.lock_store(prefix);
            for key in keys {
                let data = backing.load(prefix, &key)?;
                match Model::from_json(prefix, &data) {
                    Ok(mut m) => {
                        m.fill();
                        store.load_unchecked(m);
                    }
                    Err(e) => {
                        warn!("skipping corrupted {prefix}:{key}: {e}");
                    }
                }
            }
            debug!("loaded {} {prefix}", store.count());
        }

        // Seed the caches that validation reads.
        {
            let store = self.lock_store("preferences");
            let mut prefs = self.prefs.lock().expect("prefs cache poisoned");
            for item in store.items() {
                if let Model::Pref(p) = &**item {
                    prefs.insert(p.name.clone(), p.val.clone());
                }
            }
        }
        {
            let store = self.lock_store("templates");
            let root = models::tmpl::root_from_items(store.items(), None, None);
            *self.tmpl_root.lock().expect("template root poisoned") = root;
        }

        let mut rt = self.request(&[]);
        rt.all_locked(|tx| {
            for prefix in models::VALIDATION_ORDER {
                let keys: Vec<String> = tx
                    .store(prefix)
                    .items()
                    .iter()
                    .map(|o| o.key())
                    .collect();
                for key in keys {
                    let mut obj = match tx.store(prefix).find(&key) {
                        Some(o) => (**o).clone(),
                        None => continue,
                    };
                    obj.clear_validation();
                    let fx = models::validate(tx, &mut obj);
                    tx.replace_cached(prefix, obj.clone());
                    models::after_save(tx, &obj, fx);
                }
            }
        });
        info!("data tracker loaded and validated");
        Ok(())
    }

    pub fn request(&self, locks: &[&'static str]) -> RequestTracker<'_> {
        RequestTracker::new(self, locks)
    }

    pub fn fs(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    pub fn publishers(&self) -> &Publishers {
        &self.publishers
    }

    pub fn file_root(&self) -> &Path {
        &self.file_root
    }

    pub fn global_profile(&self) -> &str {
        &self.global_profile
    }

    pub fn pref(&self, name: &str) -> Option<String> {
        self.prefs
            .lock()
            .expect("prefs cache poisoned")
            .get(name)
            .cloned()
    }

    pub fn prefs(&self) -> BTreeMap<String, String> {
        self.prefs.lock().expect("prefs cache poisoned").clone()
    }

    pub(crate) fn cache_pref(&self, name: &str, val: &str) {
        self.prefs
            .lock()
            .expect("prefs cache poisoned")
            .insert(name.to_owned(), val.to_owned());
    }

    pub(crate) fn uncache_pref(&self, name: &str) {
        self.prefs.lock().expect("prefs cache poisoned").remove(name);
    }

    /// Snapshot of the shared root template set. Taken briefly; callers
    /// merge into their own per-object set.
    pub(crate) fn template_root(&self) -> Arc<BTreeMap<String, String>> {
        self.tmpl_root
            .lock()
            .expect("template root poisoned")
            .clone()
    }

    pub(crate) fn set_template_root(&self, root: Arc<BTreeMap<String, String>>) {
        *self.tmpl_root.lock().expect("template root poisoned") = root;
    }

    pub(crate) fn extraction_lock(&self) -> MutexGuard<'_, ()> {
        self.extract.lock().expect("extraction lock poisoned")
    }

    fn lock_store(&self, prefix: &str) -> MutexGuard<'_, CacheStore> {
        self.stores
            .get(prefix)
            .unwrap_or_else(|| panic!("unknown prefix {prefix}"))
            .lock()
            .expect("prefix lock poisoned")
    }

    /// Acquire the named prefix locks in canonical (sorted, deduplicated)
    /// order.
    pub(crate) fn lock_prefixes(&self, names: &[&'static str]) -> Stores<'_> {
        let mut wanted: Vec<&'static str> = names.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        let held = wanted
            .into_iter()
            .map(|p| {
                let guard = self.lock_store(p);
                (p, guard)
            })
            .collect();
        Stores { held }
    }

    pub(crate) fn lock_all(&self) -> Stores<'_> {
        self.lock_prefixes(PREFIXES)
    }

    /// Drain one transaction's post-commit queue, strictly in enqueue
    /// order. Called only after every prefix lock has been released.
    pub(crate) fn run_actions(&self, actions: Vec<AfterAction>) {
        for action in actions {
            match action {
                AfterAction::Event(e) => self.publishers.publish(&e),
                AfterAction::Register(rs) => self.fs.register(rs),
                AfterAction::Deregister(paths) => self.fs.deregister(&paths),
                AfterAction::AddTree(prefix, l) => self.fs.add_dynamic_tree(prefix, l),
                AfterAction::DelTree(prefix) => self.fs.del_dynamic_tree(&prefix),
                AfterAction::ExplodeIsos(tasks) => {
                    for task in &tasks {
                        iso::explode(self, task);
                    }
                }
                AfterAction::Thunk(f) => f(self),
            }
        }
    }

    fn secret_name(prefix: &str, key: &str) -> String {
        format!("{prefix}-{key}")
    }

    /// Fetch (or mint on first use) the 32-byte private key for an
    /// object. The returned buffer is wiped on drop.
    pub(crate) fn private_key_for(
        &self,
        prefix: &str,
        key: &str,
    ) -> Result<Zeroizing<Vec<u8>>, CoreError> {
        let secrets = self.secrets.lock().expect("secrets store poisoned");
        let name = Self::secret_name(prefix, key);
        match secrets.load(&name) {
            Ok(v) => Ok(Zeroizing::new(v)),
            Err(e) if e.is_not_found() => {
                let mut fresh = Zeroizing::new([0u8; 32]);
                rand::rngs::OsRng.fill_bytes(fresh.as_mut());
                secrets.save(&name, fresh.as_ref())?;
                Ok(Zeroizing::new(fresh.to_vec()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn delete_key_for(&self, prefix: &str, key: &str) -> Result<(), CoreError> {
        let secrets = self.secrets.lock().expect("secrets store poisoned");
        Ok(secrets.remove(&Self::secret_name(prefix, key))?)
    }
}
