//! Registry of named store instances.
//!
//! One server manages a set of stores keyed by name; `"main"` always
//! exists. When a persistence base path is configured, every store
//! saves to `<basePath>.<name>.db`, and startup discovers previously
//! saved stores by scanning the base path's directory. A shared dirty
//! counter makes the periodic save a no-op while nothing has changed.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::tree::TreeStore;

pub const MAIN_STORE: &str = "main";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast on every mutation; blocking commands use it as their
/// data-ready signal. The version is the value of the set-wide
/// mutation counter at publish time.
#[derive(Clone, Debug)]
pub struct KeyEvent {
    pub store: String,
    pub key: String,
    pub version: u64,
}

pub struct StoreUser {
    pub name: String,
}

pub struct StoreSet {
    base_path: Option<PathBuf>,
    app_version: u32,
    stores: Mutex<HashMap<String, Arc<TreeStore>>>,
    users: HashMap<String, StoreUser>,
    dirty: AtomicU64,
    version: AtomicU64,
    events: broadcast::Sender<KeyEvent>,
}

impl StoreSet {
    /// Create the set, always seeding `"main"`. With a base path,
    /// discover and load previously persisted stores.
    pub async fn new(base_path: Option<PathBuf>, app_version: u32) -> io::Result<Arc<StoreSet>> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut users = HashMap::new();
        users.insert(
            "default".to_string(),
            StoreUser { name: "default".to_string() },
        );
        let set = Arc::new(StoreSet {
            base_path,
            app_version,
            stores: Mutex::new(HashMap::new()),
            users,
            dirty: AtomicU64::new(0),
            version: AtomicU64::new(0),
            events,
        });
        set.get_db(MAIN_STORE, true);
        if let Some(base) = set.base_path.clone() {
            set.load_persisted(&base).await?;
        }
        Ok(set)
    }

    async fn load_persisted(&self, base: &Path) -> io::Result<()> {
        let dir = match base.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_base = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!(dir = %dir.display(), base = %file_base, "scanning for persisted stores");

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut names: Vec<(String, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(rest) = file_name.strip_prefix(&file_base) else {
                continue;
            };
            let Some(middle) = rest.strip_suffix(".db") else {
                continue;
            };
            let name = middle.trim_start_matches('.');
            if name.is_empty() {
                continue;
            }
            names.push((name.to_string(), entry.path()));
        }

        for (name, path) in names {
            let Some(store) = self.get_db(&name, true) else {
                continue;
            };
            info!(store = %name, path = %path.display(), "loading store");
            store.load(&path).await?;
        }
        Ok(())
    }

    /// Fetch a store by name, optionally creating it on demand.
    pub fn get_db(&self, name: &str, create_if_absent: bool) -> Option<Arc<TreeStore>> {
        let mut stores = self.stores.lock().unwrap();
        if let Some(store) = stores.get(name) {
            return Some(Arc::clone(store));
        }
        if !create_if_absent {
            return None;
        }
        let store = Arc::new(TreeStore::new(self.app_version));
        stores.insert(name.to_string(), Arc::clone(&store));
        metrics::gauge!("treekv_stores").set(stores.len() as f64);
        Some(store)
    }

    pub fn discard_db(&self, name: &str) {
        let mut stores = self.stores.lock().unwrap();
        stores.remove(name);
        metrics::gauge!("treekv_stores").set(stores.len() as f64);
    }

    /// Drop every store, then reseed `"main"` — it must always exist.
    pub fn discard_all(&self) {
        {
            let mut stores = self.stores.lock().unwrap();
            stores.clear();
        }
        self.get_db(MAIN_STORE, true);
    }

    pub fn get_user(&self, name: &str) -> Option<&StoreUser> {
        self.users.get(name)
    }

    pub fn store_names(&self) -> Vec<String> {
        let stores = self.stores.lock().unwrap();
        let mut names: Vec<String> = stores.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    fn store_file_name(&self, name: &str) -> Option<PathBuf> {
        let base = self.base_path.as_ref()?;
        Some(PathBuf::from(format!("{}.{}.db", base.display(), name)))
    }

    // ── Dirty tracking and mutation events ────────────────────────────────────

    /// Record a mutation: bump the dirty counter and publish the key
    /// event for blocked waiters.
    pub fn touch(&self, store: &str, key: &str) {
        self.dirty.fetch_add(1, Ordering::SeqCst);
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.events.send(KeyEvent {
            store: store.to_string(),
            key: key.to_string(),
            version,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn dirty_count(&self) -> u64 {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Persist every store when anything changed since the last save.
    /// Idempotent while clean: the dirty counter swaps to zero first
    /// and a clean set performs no file I/O. A failed save surfaces
    /// the error but does not restore the counter (at-least-once,
    /// best-effort).
    pub async fn save(&self) -> io::Result<()> {
        if self.base_path.is_none() {
            return Ok(());
        }
        if self.dirty.swap(0, Ordering::SeqCst) == 0 {
            return Ok(());
        }
        // snapshot under the lock, save outside it
        let snapshot: Vec<(String, Arc<TreeStore>)> = {
            let stores = self.stores.lock().unwrap();
            stores
                .iter()
                .map(|(name, store)| (name.clone(), Arc::clone(store)))
                .collect()
        };
        for (name, store) in snapshot {
            let Some(path) = self.store_file_name(&name) else {
                continue;
            };
            debug!(store = %name, path = %path.display(), "saving store");
            if let Err(e) = store.save(&path).await {
                error!(store = %name, path = %path.display(), error = %e, "failed to save store");
                return Err(e);
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
