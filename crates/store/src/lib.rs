//! kmirror store: keyed records with secondary indexes, published as immutable snapshots.
//!
//! Readers load the current [`StoreSnapshot`] without locking; writers are serialized and
//! publish a fresh snapshot per mutation batch, so no reader ever sees a half-applied batch.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use kmirror_core::{Indexers, KeyFunc, Record};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown index: {0}")]
    UnknownIndex(String),
}

/// A single store mutation.
#[derive(Debug, Clone)]
pub enum Op<K> {
    Put(K),
    Delete(K),
    DeleteKey(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

type Index = FxHashMap<String, BTreeSet<String>>;

/// Point-in-time view of the store.
pub struct StoreSnapshot<K> {
    pub epoch: u64,
    /// Cursor the content corresponds to, if any list or event was applied yet.
    pub resource_version: Option<String>,
    items: FxHashMap<String, Arc<K>>,
    indices: FxHashMap<String, Index>,
}

impl<K> StoreSnapshot<K> {
    fn empty(index_names: impl Iterator<Item = String>) -> Self {
        Self {
            epoch: 0,
            resource_version: None,
            items: FxHashMap::default(),
            indices: index_names.map(|n| (n, Index::default())).collect(),
        }
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.items.get(key).cloned()
    }

    /// Unordered.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.items.values().cloned().collect()
    }

    /// Unordered.
    pub fn list_keys(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<K>)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys filed under `value` in index `name`, in key order.
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<String>, StoreError> {
        let idx = self.indices.get(name).ok_or_else(|| StoreError::UnknownIndex(name.to_string()))?;
        Ok(idx.get(value).map(|keys| keys.iter().cloned().collect()).unwrap_or_default())
    }

    /// Distinct values currently present in index `name`.
    pub fn index_values(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let idx = self.indices.get(name).ok_or_else(|| StoreError::UnknownIndex(name.to_string()))?;
        let mut out: Vec<String> = idx.keys().cloned().collect();
        out.sort_unstable();
        Ok(out)
    }
}

impl<K> Clone for StoreSnapshot<K> {
    fn clone(&self) -> Self {
        Self {
            epoch: self.epoch,
            resource_version: self.resource_version.clone(),
            items: self.items.clone(),
            indices: self.indices.clone(),
        }
    }
}

/// Thread-safe keyed store. Cloning the `Arc<Store>` is how readers share it.
pub struct Store<K: Record> {
    key_fn: KeyFunc<K>,
    indexers: Indexers<K>,
    snap: ArcSwap<StoreSnapshot<K>>,
    writer: Mutex<()>,
    epoch_tx: watch::Sender<u64>,
    epoch_rx: watch::Receiver<u64>,
}

impl<K: Record> Store<K> {
    pub fn new(key_fn: KeyFunc<K>, indexers: Indexers<K>) -> Self {
        let snap = StoreSnapshot::empty(indexers.keys().cloned());
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        Self { key_fn, indexers, snap: ArcSwap::from_pointee(snap), writer: Mutex::new(()), epoch_tx, epoch_rx }
    }

    pub fn key_of(&self, obj: &K) -> Option<String> {
        match (self.key_fn)(obj) {
            Ok(k) => Some(k),
            Err(e) => {
                warn!(error = %e, name = obj.name(), "key derivation failed; skipping record");
                None
            }
        }
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot<K>> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    pub fn epoch(&self) -> u64 { self.snap.load().epoch }
    pub fn len(&self) -> usize { self.snap.load().len() }
    pub fn is_empty(&self) -> bool { self.snap.load().is_empty() }
    pub fn resource_version(&self) -> Option<String> { self.snap.load().resource_version.clone() }

    pub fn get(&self, key: &str) -> Option<Arc<K>> { self.snap.load().get(key) }
    pub fn list(&self) -> Vec<Arc<K>> { self.snap.load().list() }
    pub fn list_keys(&self) -> Vec<String> { self.snap.load().list_keys() }

    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<String>, StoreError> {
        self.snap.load().by_index(name, value)
    }

    pub fn index_values(&self, name: &str) -> Result<Vec<String>, StoreError> {
        self.snap.load().index_values(name)
    }

    /// Insert or overwrite.
    pub fn put(&self, obj: K) {
        self.apply(vec![Op::Put(obj)], None);
    }

    /// Remove if present; absent keys are a no-op.
    pub fn delete(&self, obj: &K) {
        if let Some(key) = self.key_of(obj) {
            self.apply(vec![Op::DeleteKey(key)], None);
        }
    }

    pub fn delete_key(&self, key: &str) {
        self.apply(vec![Op::DeleteKey(key.to_string())], None);
    }

    pub fn set_resource_version(&self, rv: String) {
        self.apply(Vec::new(), Some(rv));
    }

    /// Apply a batch of mutations in order and publish them as one snapshot.
    /// `rv`, when given, becomes the snapshot's cursor.
    pub fn apply(&self, ops: Vec<Op<K>>, rv: Option<String>) {
        self.mutate(|next| {
            for op in ops {
                match op {
                    Op::Put(obj) => {
                        if let Some(key) = self.key_of(&obj) {
                            self.insert(next, key, Arc::new(obj));
                        }
                    }
                    Op::Delete(obj) => {
                        if let Some(key) = self.key_of(&obj) {
                            self.remove(next, &key);
                        }
                    }
                    Op::DeleteKey(key) => self.remove(next, &key),
                }
            }
            if rv.is_some() {
                next.resource_version = rv;
            }
        });
    }

    /// Swap the whole content for `items`.
    pub fn replace(&self, items: Vec<K>, rv: String) {
        let mut fresh = StoreSnapshot::empty(self.indexers.keys().cloned());
        for obj in items {
            if let Some(key) = self.key_of(&obj) {
                self.insert(&mut fresh, key, Arc::new(obj));
            }
        }
        fresh.resource_version = Some(rv);
        self.mutate(move |next| {
            fresh.epoch = next.epoch;
            *next = fresh;
        });
    }

    /// Like [`Store::replace`] but diffed against current content: keys missing from
    /// `items` are deleted and entries whose resource version did not change are kept as-is.
    pub fn reconcile(&self, items: Vec<K>, rv: String) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        self.mutate(|next| {
            let mut seen: FxHashSet<String> = FxHashSet::default();
            for obj in items {
                let Some(key) = self.key_of(&obj) else { continue };
                seen.insert(key.clone());
                match next.items.get(&key).map(|old| same_version::<K>(old, &obj)) {
                    Some(true) => stats.unchanged += 1,
                    Some(false) => {
                        stats.updated += 1;
                        self.insert(next, key, Arc::new(obj));
                    }
                    None => {
                        stats.added += 1;
                        self.insert(next, key, Arc::new(obj));
                    }
                }
            }
            let stale: Vec<String> = next.items.keys().filter(|k| !seen.contains(*k)).cloned().collect();
            stats.deleted = stale.len();
            for key in stale {
                self.remove(next, &key);
            }
            next.resource_version = Some(rv);
        });
        debug!(?stats, "store reconciled");
        stats
    }

    fn mutate(&self, f: impl FnOnce(&mut StoreSnapshot<K>)) {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = StoreSnapshot::clone(&self.snap.load());
        f(&mut next);
        next.epoch = next.epoch.saturating_add(1);
        let epoch = next.epoch;
        self.snap.store(Arc::new(next));
        let _ = self.epoch_tx.send(epoch);
    }

    fn insert(&self, snap: &mut StoreSnapshot<K>, key: String, obj: Arc<K>) {
        if let Some(old) = snap.items.get(&key).cloned() {
            self.unindex(snap, &key, &old);
        }
        for (name, f) in self.indexers.iter() {
            let idx = snap.indices.entry(name.clone()).or_default();
            for value in f(&obj) {
                idx.entry(value).or_default().insert(key.clone());
            }
        }
        snap.items.insert(key, obj);
    }

    fn remove(&self, snap: &mut StoreSnapshot<K>, key: &str) {
        if let Some(old) = snap.items.remove(key) {
            self.unindex(snap, key, &old);
        }
    }

    fn unindex(&self, snap: &mut StoreSnapshot<K>, key: &str, obj: &K) {
        for (name, f) in self.indexers.iter() {
            let Some(idx) = snap.indices.get_mut(name) else { continue };
            for value in f(obj) {
                if let Some(keys) = idx.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        idx.remove(&value);
                    }
                }
            }
        }
    }
}

fn same_version<K: Record>(old: &K, new: &K) -> bool {
    match (old.resource_version(), new.resource_version()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
