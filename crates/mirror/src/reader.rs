use std::sync::Arc;
use std::time::Duration;

use kmirror_core::{Record, Selector};
use kmirror_store::{Store, StoreError, StoreSnapshot};
use tokio::sync::watch;

/// Read-only view of a mirror. Cheap to clone; every read works before the first sync too,
/// so callers that need complete data gate on [`SyncedReader::wait_for_sync`] first.
pub struct SyncedReader<K: Record> {
    store: Arc<Store<K>>,
    synced_rx: watch::Receiver<bool>,
}

impl<K: Record> Clone for SyncedReader<K> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), synced_rx: self.synced_rx.clone() }
    }
}

impl<K: Record> SyncedReader<K> {
    pub(crate) fn new(store: Arc<Store<K>>, synced_rx: watch::Receiver<bool>) -> Self {
        Self { store, synced_rx }
    }

    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// Wait until the first full list has been applied. A zero timeout polls once.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        if self.has_synced() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        let mut rx = self.synced_rx.clone();
        let synced = matches!(tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await, Ok(Ok(_)));
        synced
    }

    /// Receiver of the sync flag, for callers that want to react to it themselves.
    pub fn subscribe_sync(&self) -> watch::Receiver<bool> {
        self.synced_rx.clone()
    }

    /// Receiver ticking on every published store snapshot.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.store.subscribe_epoch()
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot<K>> {
        self.store.snapshot()
    }

    /// Records matching `selector`, unordered.
    pub fn list(&self, selector: &Selector) -> Vec<Arc<K>> {
        let snap = self.store.snapshot();
        snap.iter().filter(|(_, o)| selector.matches::<K>(o)).map(|(_, o)| Arc::clone(o)).collect()
    }

    /// Records matching `selector`, ordered by key.
    pub fn list_sorted(&self, selector: &Selector) -> Vec<Arc<K>> {
        let snap = self.store.snapshot();
        let mut hits: Vec<(&str, &Arc<K>)> = snap.iter().filter(|(_, o)| selector.matches::<K>(o)).collect();
        hits.sort_unstable_by(|a, b| a.0.cmp(b.0));
        hits.into_iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    /// Lookup by partition and name, assuming the default `"<ns>/<name>"` key layout.
    pub fn get(&self, partition: Option<&str>, name: &str) -> Option<Arc<K>> {
        match partition {
            Some(ns) if !ns.is_empty() => self.store.get(&format!("{}/{}", ns, name)),
            _ => self.store.get(name),
        }
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        self.store.get(key)
    }

    /// Records filed under `value` in index `index`, ordered by key.
    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>, StoreError> {
        let snap = self.store.snapshot();
        let keys = snap.by_index(index, value)?;
        Ok(keys.iter().filter_map(|k| snap.get(k)).collect())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Cursor the current content corresponds to.
    pub fn last_sync_resource_version(&self) -> Option<String> {
        self.store.resource_version()
    }
}
