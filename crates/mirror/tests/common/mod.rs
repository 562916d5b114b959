#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use kmirror::{ListPage, MirrorConfig, SourceError, WatchEvent, WatchStream};
use kmirror_core::{ChangeSource, Partition, Record, Selector};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub struct Obj {
    pub ns: Option<String>,
    pub name: String,
    pub rv: String,
    pub labels: BTreeMap<String, String>,
}

impl Record for Obj {
    fn namespace(&self) -> Option<&str> { self.ns.as_deref() }
    fn name(&self) -> &str { &self.name }
    fn resource_version(&self) -> Option<&str> { Some(&self.rv) }
    fn label(&self, key: &str) -> Option<&str> { self.labels.get(key).map(|s| s.as_str()) }
}

pub fn obj(ns: Option<&str>, name: &str, rv: u64) -> Obj {
    Obj { ns: ns.map(|s| s.to_string()), name: name.to_string(), rv: rv.to_string(), labels: BTreeMap::new() }
}

pub fn labelled(ns: Option<&str>, name: &str, rv: u64, labels: &[(&str, &str)]) -> Obj {
    let mut o = obj(ns, name, rv);
    o.labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    o
}

pub fn page(items: Vec<Obj>, rv: u64) -> Result<ListPage<Obj>, SourceError> {
    Ok(ListPage { items, resource_version: rv.to_string() })
}

pub fn transport(msg: &str) -> SourceError {
    SourceError::Transport(msg.to_string())
}

/// One scripted watch call.
pub enum WatchScript {
    /// `watch` itself fails.
    Fail(SourceError),
    /// Yield `items`, then either close (`hang == false`) or stay open forever.
    Stream { items: Vec<Step>, hang: bool },
}

pub enum Step {
    Item(Result<WatchEvent<Obj>, SourceError>),
    /// Pause the stream until the test notifies.
    Gate(Arc<Notify>),
}

pub fn ev(e: WatchEvent<Obj>) -> Step {
    Step::Item(Ok(e))
}

pub fn err(e: SourceError) -> Step {
    Step::Item(Err(e))
}

/// Change source replaying scripted list and watch results. Once a script runs out, lists fail
/// with a transport error and watches stay open without events.
#[derive(Default)]
pub struct ScriptedSource {
    lists: Mutex<VecDeque<Result<ListPage<Obj>, SourceError>>>,
    watches: Mutex<VecDeque<WatchScript>>,
    pub calls: Arc<Calls>,
}

#[derive(Default)]
pub struct Calls {
    pub lists: Mutex<Vec<(String, Partition)>>,
    pub watches: Mutex<Vec<String>>,
}

impl Calls {
    pub fn list_count(&self) -> usize { self.lists.lock().unwrap().len() }
    pub fn watch_cursors(&self) -> Vec<String> { self.watches.lock().unwrap().clone() }
}

impl ScriptedSource {
    pub fn new() -> Self { Self::default() }

    pub fn then_list(self, r: Result<ListPage<Obj>, SourceError>) -> Self {
        self.lists.lock().unwrap().push_back(r);
        self
    }

    pub fn then_watch(self, w: WatchScript) -> Self {
        self.watches.lock().unwrap().push_back(w);
        self
    }
}

#[async_trait::async_trait]
impl ChangeSource<Obj> for ScriptedSource {
    async fn list(&self, selector: &Selector, partition: &Partition) -> Result<ListPage<Obj>, SourceError> {
        self.calls.lists.lock().unwrap().push((selector.to_string(), partition.clone()));
        let next = self.lists.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(transport("list script exhausted")))
    }

    async fn watch(&self, cursor: &str, _selector: &Selector, _partition: &Partition) -> Result<WatchStream<Obj>, SourceError> {
        self.calls.watches.lock().unwrap().push(cursor.to_string());
        let next = self.watches.lock().unwrap().pop_front();
        match next {
            None => Ok(futures::stream::pending().boxed()),
            Some(WatchScript::Fail(e)) => Err(e),
            Some(WatchScript::Stream { items, hang }) => {
                let s = async_stream::stream! {
                    for step in items {
                        match step {
                            Step::Item(item) => yield item,
                            Step::Gate(n) => n.notified().await,
                        }
                    }
                    if hang {
                        futures::future::pending::<()>().await;
                    }
                };
                Ok(s.boxed())
            }
        }
    }
}

pub fn fast_config() -> MirrorConfig {
    MirrorConfig {
        backoff_initial_ms: 1,
        backoff_max_ms: 10,
        backoff_factor: 2.0,
        jitter: 0.0,
        resync_secs: 0,
        watch_timeout_secs: 5,
        max_batch: 16,
    }
}

/// Poll `cond` until it holds or a generous deadline passes.
pub async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

pub fn sorted_names(items: &[Arc<Obj>]) -> Vec<String> {
    let mut names: Vec<String> = items.iter().map(|o| o.name.clone()).collect();
    names.sort_unstable();
    names
}
