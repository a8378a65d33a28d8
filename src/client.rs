//! Per-client state and the live-client registry.
//!
//! A client processes one command at a time; the connection state
//! machine serialises commands from the same socket. A blocking
//! command *captures* the client and waits on three signals at once: a
//! data-ready event it owns, a timeout it owns, and the shared unblock
//! channel other actors use to cancel the wait. The capture word is a
//! four-state atomic driven only by compare-and-swap; see the method
//! comments for the transition discipline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::trace;

use crate::store_set::{StoreSet, MAIN_STORE};
use crate::tree::TreeStore;

pub const CS_UNCAPTURED: u8 = 0;
pub const CS_DRAINING: u8 = 1;
pub const CS_CAPTURED: u8 = 2;
pub const CS_CHECKING: u8 = 3;

const BACKOFF_CAP_US: u64 = 4000;
const BACKOFF_JITTER_US: u64 = 200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnblockReason {
    pub reason: String,
    pub is_error: bool,
}

/// The connection side of a client, as seen by the registry and the
/// admin commands. Socket connections implement this; the embedded
/// dispatch path has none.
pub trait ClientLink: Send + Sync {
    /// Descriptive `key=value` strings: remote/local address, age.
    fn client_info(&self) -> Vec<String>;
    fn matches_filter(&self, filter: &HashMap<String, String>) -> bool;
    fn request_close(&self);
    fn is_close_requested(&self) -> bool;
}

pub struct ClientState {
    pub id: u64,
    user: String,
    selected: Mutex<Selected>,
    store_set: Arc<StoreSet>,
    link: Option<Arc<dyn ClientLink>>,
    watches: Mutex<HashMap<(String, String), u64>>,
    blocked: AtomicU8,
    unblock_pending: AtomicBool,
    unblock_tx: mpsc::Sender<UnblockReason>,
    unblock_rx: tokio::sync::Mutex<mpsc::Receiver<UnblockReason>>,
    resp_version: AtomicU8,
    multi_in_progress: AtomicBool,
}

struct Selected {
    name: String,
    store: Arc<TreeStore>,
}

impl ClientState {
    fn new(
        id: u64,
        store_set: Arc<StoreSet>,
        link: Option<Arc<dyn ClientLink>>,
    ) -> Arc<ClientState> {
        let store = store_set
            .get_db(MAIN_STORE, true)
            .unwrap_or_else(|| Arc::new(TreeStore::new(0)));
        // capacity 1: at most one unblock notice is ever in flight
        let (unblock_tx, unblock_rx) = mpsc::channel(1);
        Arc::new(ClientState {
            id,
            user: "default".to_string(),
            selected: Mutex::new(Selected { name: MAIN_STORE.to_string(), store }),
            store_set,
            link,
            watches: Mutex::new(HashMap::new()),
            blocked: AtomicU8::new(CS_UNCAPTURED),
            unblock_pending: AtomicBool::new(false),
            unblock_tx,
            unblock_rx: tokio::sync::Mutex::new(unblock_rx),
            resp_version: AtomicU8::new(2),
            multi_in_progress: AtomicBool::new(false),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn link(&self) -> Option<&Arc<dyn ClientLink>> {
        self.link.as_ref()
    }

    pub fn store(&self) -> Arc<TreeStore> {
        Arc::clone(&self.selected.lock().unwrap().store)
    }

    pub fn selected_db(&self) -> String {
        self.selected.lock().unwrap().name.clone()
    }

    /// Switch the client's current store, creating it on demand.
    /// Returns the prior selection.
    pub fn select_db(&self, name: &str) -> Option<String> {
        let store = self.store_set.get_db(name, true)?;
        let mut selected = self.selected.lock().unwrap();
        let prior = std::mem::replace(&mut selected.name, name.to_string());
        selected.store = store;
        Some(prior)
    }

    pub fn set_multi_in_progress(&self, in_progress: bool) {
        self.multi_in_progress.store(in_progress, Ordering::SeqCst);
    }

    pub fn is_multi_in_progress(&self) -> bool {
        self.multi_in_progress.load(Ordering::SeqCst)
    }

    /// Wire dialect version; today every client speaks version 2.
    pub fn resp_version(&self) -> u8 {
        self.resp_version.load(Ordering::SeqCst)
    }

    // ── Watches ───────────────────────────────────────────────────────────────

    pub fn watch_version(&self, store: &str, key: &str) -> Option<u64> {
        self.watches
            .lock()
            .unwrap()
            .get(&(store.to_string(), key.to_string()))
            .copied()
    }

    pub fn set_watch_version(&self, store: &str, key: &str, version: u64) {
        self.watches
            .lock()
            .unwrap()
            .insert((store.to_string(), key.to_string()), version);
    }

    // ── Capture / release / unblock ───────────────────────────────────────────

    /// Spin a compare-and-swap of the capture word with exponential
    /// backoff from 1µs, capped at 4ms and then randomized to avoid
    /// lockstep with other spinners.
    async fn set_lock(&self, from: u8, to: u8) {
        let mut us = 1u64;
        loop {
            if self
                .blocked
                .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            if us < BACKOFF_CAP_US {
                us *= 2;
            } else {
                us = rand::rng().random_range(0..BACKOFF_JITTER_US);
            }
            tokio::time::sleep(Duration::from_micros(us.max(1))).await;
        }
    }

    /// Capture the client for a blocking command and hand back the
    /// unblock channel. The caller selects on this receiver, its own
    /// data-ready signal, and its own timeout, then calls
    /// [`release_capture`](Self::release_capture).
    pub async fn capture(&self) -> tokio::sync::MutexGuard<'_, mpsc::Receiver<UnblockReason>> {
        self.set_lock(CS_UNCAPTURED, CS_CAPTURED).await;
        self.unblock_rx.lock().await
    }

    /// Release a capture. The unblock channel is shared across
    /// captures, so it must be drained before the client returns to
    /// UNCAPTURED; DRAINING keeps new unblock notices out while that
    /// happens.
    pub async fn release_capture(&self) {
        self.set_lock(CS_CAPTURED, CS_DRAINING).await;
        {
            let mut rx = self.unblock_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }
        self.unblock_pending.store(false, Ordering::SeqCst);
        self.set_lock(CS_DRAINING, CS_UNCAPTURED).await;
    }

    /// Tell a blocking command (if any) to end. For a timeout, pass an
    /// empty reason and `is_error` false. At most one notice is
    /// delivered per capture, no matter how many actors race here.
    pub async fn unblock(&self, reason: &str, is_error: bool) {
        let mut us = 1u64;
        loop {
            // checking is allowed in the midst of capture and release
            let prior = self.blocked.swap(CS_CHECKING, Ordering::AcqRel);
            if prior == CS_CAPTURED
                && self
                    .unblock_pending
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                // capacity 1 and the pending latch guarantee space
                let _ = self.unblock_tx.try_send(UnblockReason {
                    reason: reason.to_string(),
                    is_error,
                });
            }
            self.blocked.swap(prior, Ordering::AcqRel);

            if prior == CS_UNCAPTURED || prior == CS_CAPTURED {
                return;
            }

            // DRAINING, or CHECKING from another caller: try again
            if us < BACKOFF_CAP_US {
                us *= 2;
            } else {
                us = rand::rng().random_range(0..BACKOFF_JITTER_US);
            }
            tokio::time::sleep(Duration::from_micros(us.max(1))).await;
        }
    }

    pub async fn is_blocked(&self) -> bool {
        let mut us = 1u64;
        loop {
            let prior = self.blocked.swap(CS_CHECKING, Ordering::AcqRel);
            self.blocked.swap(prior, Ordering::AcqRel);

            match prior {
                CS_CAPTURED => return true,
                CS_UNCAPTURED => return false,
                _ => {}
            }

            if us < BACKOFF_CAP_US {
                us *= 2;
            } else {
                us = rand::rng().random_range(0..BACKOFF_JITTER_US);
            }
            tokio::time::sleep(Duration::from_micros(us.max(1))).await;
        }
    }
}

// ── Client registry ───────────────────────────────────────────────────────────

/// Registry of every live client, keyed by monotonic id. Admin
/// commands scan it; shutdown drains it.
pub struct ClientRegistry {
    next_id: AtomicU64,
    clients: Mutex<HashMap<u64, Arc<ClientState>>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        store_set: Arc<StoreSet>,
        link: Option<Arc<dyn ClientLink>>,
    ) -> Arc<ClientState> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cs = ClientState::new(id, store_set, link);
        let mut clients = self.clients.lock().unwrap();
        clients.insert(id, Arc::clone(&cs));
        metrics::gauge!("treekv_clients_connected").set(clients.len() as f64);
        cs
    }

    pub fn unregister(&self, id: u64) {
        let mut clients = self.clients.lock().unwrap();
        clients.remove(&id);
        metrics::gauge!("treekv_clients_connected").set(clients.len() as f64);
        trace!(client = id, "client unregistered");
    }

    pub fn is_any_active(&self) -> bool {
        !self.clients.lock().unwrap().is_empty()
    }

    pub fn get(&self, id: u64) -> Option<Arc<ClientState>> {
        self.clients.lock().unwrap().get(&id).cloned()
    }

    /// Snapshot the live clients whose connection has not requested
    /// close. The lock is released before the caller touches any
    /// per-client state.
    pub fn snapshot(&self) -> Vec<Arc<ClientState>> {
        let clients = self.clients.lock().unwrap();
        let mut list: Vec<Arc<ClientState>> = clients
            .values()
            .filter(|cs| !cs.link().is_some_and(|l| l.is_close_requested()))
            .cloned()
            .collect();
        list.sort_by_key(|cs| cs.id);
        list
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_set::StoreSet;

    async fn test_client() -> Arc<ClientState> {
        let set = StoreSet::new(None, 1).await.unwrap();
        let registry = ClientRegistry::new();
        registry.register(set, None)
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let set = StoreSet::new(None, 1).await.unwrap();
        let registry = ClientRegistry::new();
        let a = registry.register(Arc::clone(&set), None);
        let b = registry.register(set, None);
        assert!(b.id > a.id);
        registry.unregister(a.id);
        registry.unregister(b.id);
        assert!(!registry.is_any_active());
    }

    #[tokio::test]
    async fn select_db_reports_prior() {
        let cs = test_client().await;
        assert_eq!(cs.selected_db(), "main");
        let prior = cs.select_db("scratch").unwrap();
        assert_eq!(prior, "main");
        assert_eq!(cs.selected_db(), "scratch");
    }

    #[tokio::test]
    async fn multi_flag_round_trip() {
        let cs = test_client().await;
        assert!(!cs.is_multi_in_progress());
        cs.set_multi_in_progress(true);
        assert!(cs.is_multi_in_progress());
        cs.set_multi_in_progress(false);
        assert!(!cs.is_multi_in_progress());
    }

    #[tokio::test]
    async fn capture_then_release_is_clean() {
        let cs = test_client().await;
        assert!(!cs.is_blocked().await);
        {
            let _rx = cs.capture().await;
            assert!(cs.is_blocked().await);
        }
        cs.release_capture().await;
        assert!(!cs.is_blocked().await);
    }

    #[tokio::test]
    async fn unblock_reaches_captured_client() {
        let cs = test_client().await;
        let mut rx = cs.capture().await;
        cs.unblock("stop", true).await;
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.reason, "stop");
        assert!(notice.is_error);
        drop(rx);
        cs.release_capture().await;
    }

    #[tokio::test]
    async fn unblock_without_capture_is_a_noop() {
        let cs = test_client().await;
        cs.unblock("nobody home", false).await;
        // the notice must not leak into a later capture
        let mut rx = cs.capture().await;
        assert!(rx.try_recv().is_err());
        drop(rx);
        cs.release_capture().await;
    }

    #[tokio::test]
    async fn at_most_one_unblock_per_capture() {
        let cs = test_client().await;
        let mut rx = cs.capture().await;

        let mut tasks = Vec::new();
        for i in 0..32 {
            let cs = Arc::clone(&cs);
            tasks.push(tokio::spawn(async move {
                cs.unblock(&format!("racer {i}"), false).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
        drop(rx);
        cs.release_capture().await;

        // the next capture starts with an empty channel
        let mut rx = cs.capture().await;
        assert!(rx.try_recv().is_err());
        drop(rx);
        cs.release_capture().await;
    }

    #[tokio::test]
    async fn watches_track_versions() {
        let cs = test_client().await;
        assert!(cs.watch_version("main", "/k").is_none());
        cs.set_watch_version("main", "/k", 7);
        assert_eq!(cs.watch_version("main", "/k"), Some(7));
    }
}
