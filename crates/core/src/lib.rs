//! kmirror core types: records, keys, selectors and the change-source seam.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::stream::BoxStream;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

mod selector;

pub use selector::{Requirement, Selector, SelectorError};

pub mod prelude {
    pub use super::{
        namespace_indexer, namespace_key_func, split_key, ChangeSource, IndexFunc, Indexers, KeyError, KeyFunc,
        ListPage, Partition, Record, Selector, SourceError, WatchEvent, NAMESPACE_INDEX,
    };
}

/// A versioned, identifiable value mirrored from a remote collection.
///
/// Implementors only expose identity, revision and labels; the payload stays opaque.
pub trait Record: Clone + Send + Sync + 'static {
    /// Partition (namespace) of the record; `None` for unpartitioned kinds.
    fn namespace(&self) -> Option<&str>;
    fn name(&self) -> &str;
    /// Opaque revision marker; used as the watch cursor.
    fn resource_version(&self) -> Option<&str>;
    fn label(&self, key: &str) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("record has no name")]
    MissingName,
    #[error("key function: {0}")]
    Other(String),
}

/// Derives the store key of a record.
pub type KeyFunc<K> = Arc<dyn Fn(&K) -> Result<String, KeyError> + Send + Sync>;

/// Yields the index values a record is filed under (zero or more).
pub type IndexFunc<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// Named index functions maintained by the store.
pub type Indexers<K> = FxHashMap<String, IndexFunc<K>>;

pub const NAMESPACE_INDEX: &str = "namespace";

/// `"<ns>/<name>"` for partitioned records, `"<name>"` otherwise.
pub fn namespace_key_func<K: Record>() -> KeyFunc<K> {
    Arc::new(|obj: &K| {
        let name = obj.name();
        if name.is_empty() {
            return Err(KeyError::MissingName);
        }
        Ok(match obj.namespace() {
            Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
            _ => name.to_string(),
        })
    })
}

/// Inverse of [`namespace_key_func`].
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

/// Indexes records by namespace; unpartitioned records are not indexed.
pub fn namespace_indexer<K: Record>() -> (String, IndexFunc<K>) {
    let f: IndexFunc<K> = Arc::new(|obj: &K| match obj.namespace() {
        Some(ns) if !ns.is_empty() => vec![ns.to_string()],
        _ => Vec::new(),
    });
    (NAMESPACE_INDEX.to_string(), f)
}

/// Scope of a mirrored collection, chosen once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Partition {
    #[default]
    All,
    Namespace(String),
}

impl Partition {
    /// An empty or missing namespace means every partition.
    pub fn from_namespace(ns: Option<&str>) -> Self {
        match ns {
            Some(ns) if !ns.is_empty() => Partition::Namespace(ns.to_string()),
            _ => Partition::All,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Partition::All => None,
            Partition::Namespace(ns) => Some(ns.as_str()),
        }
    }

    /// Whether a record in `ns` belongs to this partition.
    pub fn contains(&self, ns: Option<&str>) -> bool {
        match self {
            Partition::All => true,
            Partition::Namespace(want) => ns == Some(want.as_str()),
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partition::All => f.write_str("(all)"),
            Partition::Namespace(ns) => f.write_str(ns),
        }
    }
}

/// A change observed on the watch stream. Events carry full values, never diffs.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker: the cursor moved without any visible change.
    Bookmark(String),
}

impl<K: Record> WatchEvent<K> {
    /// Cursor to resume from after this event, when the event carries one.
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.resource_version(),
            WatchEvent::Bookmark(rv) => Some(rv.as_str()),
        }
    }
}

/// Result of a full listing.
#[derive(Debug, Clone)]
pub struct ListPage<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// Connectivity or auth failure; retried with backoff.
    #[error("transport: {0}")]
    Transport(String),
    /// The source can no longer resume from the given cursor; a full relist is required.
    #[error("cursor expired: {0}")]
    CursorExpired(String),
    /// A single malformed record; the event is dropped.
    #[error("decode: {0}")]
    Decode(String),
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, SourceError>>;

/// The remote collection a mirror follows. Issuing the actual calls is up to the implementor.
#[async_trait::async_trait]
pub trait ChangeSource<K: Record>: Send + Sync + 'static {
    async fn list(&self, selector: &Selector, partition: &Partition) -> Result<ListPage<K>, SourceError>;

    /// Open a change stream starting after `cursor`. The stream ends cleanly when the
    /// source closes it (e.g. its own timeout window) and reports failures in-band.
    async fn watch(&self, cursor: &str, selector: &Selector, partition: &Partition) -> Result<WatchStream<K>, SourceError>;
}

#[cfg(feature = "kube")]
impl Record for kube::core::DynamicObject {
    fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref().and_then(|l| l.get(key)).map(|s| s.as_str())
    }
}
