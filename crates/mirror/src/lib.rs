//! kmirror: keeps a local, queryable mirror of a remote collection in sync via list+watch.
//!
//! A [`Mirror`] owns one [`Store`] and, once started, one background reflector task that is the
//! store's only writer. Readers obtained from [`Mirror::reader`] can be used at any time.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kmirror_core::{ChangeSource, Indexers, KeyFunc, Partition, Record, Selector};
use kmirror_store::Store;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

mod backoff;
mod config;
mod reader;
mod reflector;

pub use backoff::Backoff;
pub use config::MirrorConfig;
pub use reader::SyncedReader;
pub use reflector::Phase;

pub use kmirror_core::{namespace_indexer, namespace_key_func, ListPage, SourceError, WatchEvent, WatchStream};
pub use kmirror_store::{StoreError, StoreSnapshot};

/// Handle to a running mirror task. Cancelling is cooperative and idempotent.
///
/// Dropping the handle that owns the task cancels it; handles from repeated
/// [`Mirror::start`] calls do not.
#[derive(Debug)]
pub struct CancelHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the background task to finish. Returns immediately for handles that do not own it.
    pub async fn stopped(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "mirror task ended abnormally");
            }
        }
    }

    /// Cancel and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.cancel();
        self.stopped().await;
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.token.cancel();
        }
    }
}

pub struct Mirror<K: Record> {
    name: String,
    source: Arc<dyn ChangeSource<K>>,
    selector: Selector,
    partition: Partition,
    config: MirrorConfig,
    store: Arc<Store<K>>,
    synced_tx: Arc<watch::Sender<bool>>,
    synced_rx: watch::Receiver<bool>,
    phase_tx: Arc<watch::Sender<Phase>>,
    phase_rx: watch::Receiver<Phase>,
    token: CancellationToken,
    started: AtomicBool,
}

impl<K: Record> Mirror<K> {
    pub fn new<S>(source: S, key_fn: KeyFunc<K>, indexers: Indexers<K>, partition: Partition) -> Self
    where
        S: ChangeSource<K>,
    {
        let (synced_tx, synced_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(Phase::Initial);
        Self {
            name: "mirror".to_string(),
            source: Arc::new(source),
            selector: Selector::everything(),
            partition,
            config: MirrorConfig::default(),
            store: Arc::new(Store::new(key_fn, indexers)),
            synced_tx: Arc::new(synced_tx),
            synced_rx,
            phase_tx: Arc::new(phase_tx),
            phase_rx,
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Name used in logs and metric labels.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Selector passed through to the source's list and watch calls.
    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_config(mut self, config: MirrorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn partition(&self) -> &Partition { &self.partition }
    pub fn selector(&self) -> &Selector { &self.selector }

    pub fn reader(&self) -> SyncedReader<K> {
        SyncedReader::new(Arc::clone(&self.store), self.synced_rx.clone())
    }

    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase_rx.clone()
    }

    /// Spawn the reflector on the current tokio runtime. Only the first call spawns; later calls
    /// return a handle that can cancel the same task but not await it.
    ///
    /// The reflector runs until cancelled or until the returned handle is dropped, so keep the
    /// handle for as long as the mirror should stay live.
    pub fn start(&self) -> CancelHandle {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(mirror = %self.name, "mirror already started");
            return CancelHandle { token: self.token.clone(), task: None };
        }
        let reflector = reflector::Reflector {
            name: self.name.clone(),
            source: Arc::clone(&self.source),
            selector: self.selector.clone(),
            partition: self.partition.clone(),
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            synced_tx: Arc::clone(&self.synced_tx),
            phase_tx: Arc::clone(&self.phase_tx),
            token: self.token.clone(),
        };
        let task = tokio::spawn(reflector.run());
        CancelHandle { token: self.token.clone(), task: Some(task) }
    }
}
