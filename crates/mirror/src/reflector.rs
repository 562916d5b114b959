//! List-then-watch synchronization loop.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use kmirror_core::{ChangeSource, Partition, Record, Selector, SourceError, WatchEvent};
use kmirror_store::{Op, Store};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Backoff, MirrorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Initial,
    /// Cold list; the store is replaced wholesale on the first sync.
    Listing,
    Watching,
    /// Relist diffed against current content to recover missed deletions.
    Resyncing,
    Stopped,
}

pub(crate) struct Reflector<K: Record> {
    pub(crate) name: String,
    pub(crate) source: Arc<dyn ChangeSource<K>>,
    pub(crate) selector: Selector,
    pub(crate) partition: Partition,
    pub(crate) config: MirrorConfig,
    pub(crate) store: Arc<Store<K>>,
    pub(crate) synced_tx: Arc<watch::Sender<bool>>,
    pub(crate) phase_tx: Arc<watch::Sender<Phase>>,
    pub(crate) token: CancellationToken,
}

impl<K: Record> Reflector<K> {
    pub(crate) async fn run(self) {
        let mut list_backoff = Backoff::from_config(&self.config);
        let mut watch_backoff = Backoff::from_config(&self.config);
        let mut cursor: Option<String> = None;
        let mut phase = Phase::Listing;
        info!(mirror = %self.name, partition = %self.partition, selector = %self.selector, "reflector started");
        loop {
            if self.token.is_cancelled() {
                phase = Phase::Stopped;
            }
            self.phase_tx.send_replace(phase);
            phase = match phase {
                Phase::Initial => Phase::Listing,
                Phase::Listing | Phase::Resyncing => self.list(phase, &mut cursor, &mut list_backoff).await,
                Phase::Watching => self.watch(&mut cursor, &mut watch_backoff).await,
                Phase::Stopped => break,
            };
        }
        info!(mirror = %self.name, "reflector stopped");
    }

    async fn list(&self, phase: Phase, cursor: &mut Option<String>, backoff: &mut Backoff) -> Phase {
        let res = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Phase::Stopped,
            r = self.source.list(&self.selector, &self.partition) => r,
        };
        counter!("mirror_lists_total", 1, "mirror" => self.name.clone());
        match res {
            Ok(page) => {
                let count = page.items.len();
                if self.has_synced() {
                    let stats = self.store.reconcile(page.items, page.resource_version.clone());
                    info!(mirror = %self.name, ?phase, added = stats.added, updated = stats.updated, deleted = stats.deleted, unchanged = stats.unchanged, rv = %page.resource_version, "relist reconciled");
                } else {
                    self.store.replace(page.items, page.resource_version.clone());
                    debug!(mirror = %self.name, count, rv = %page.resource_version, "initial list applied");
                }
                gauge!("mirror_store_items", self.store.len() as f64, "mirror" => self.name.clone());
                *cursor = Some(page.resource_version);
                backoff.reset();
                self.mark_synced();
                Phase::Watching
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(mirror = %self.name, ?phase, error = %e, attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "list failed; backing off");
                if self.sleep(delay).await { phase } else { Phase::Stopped }
            }
        }
    }

    /// `backoff` only resets once a stream proves healthy, so a source that lists fine but
    /// keeps refusing watches is not relisted in a tight loop.
    async fn watch(&self, cursor: &mut Option<String>, backoff: &mut Backoff) -> Phase {
        let Some(from) = cursor.clone() else { return Phase::Listing };
        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Phase::Stopped,
            r = self.source.watch(&from, &self.selector, &self.partition) => r,
        };
        let stream = match opened {
            Ok(s) => s,
            Err(e) => return self.on_stream_error(e, cursor, backoff).await,
        };
        debug!(mirror = %self.name, rv = %from, "watch opened");
        let mut stream = stream.fuse();
        let opened_at = Instant::now();
        let healthy_after = Duration::from_millis(self.config.backoff_max_ms);
        let resync_at = self.config.resync_period().map(|d| opened_at + d);
        let max_batch = self.config.max_batch.max(1);
        let mut delivered = false;

        loop {
            let first = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Phase::Stopped,
                _ = resync_timer(resync_at) => {
                    info!(mirror = %self.name, "periodic resync");
                    return Phase::Resyncing;
                }
                ev = stream.next() => ev,
            };
            let Some(first) = first else {
                if delivered || opened_at.elapsed() >= healthy_after {
                    debug!(mirror = %self.name, "watch stream closed");
                    backoff.reset();
                    return Phase::Resyncing;
                }
                let delay = backoff.next_delay();
                debug!(mirror = %self.name, attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "watch stream closed early");
                return if self.sleep(delay).await { Phase::Resyncing } else { Phase::Stopped };
            };
            if first.is_ok() && !delivered {
                delivered = true;
                backoff.reset();
            }

            let mut batch = vec![first];
            while batch.len() < max_batch {
                match stream.next().now_or_never() {
                    Some(Some(ev)) => batch.push(ev),
                    _ => break,
                }
            }

            let mut ops = Vec::with_capacity(batch.len());
            let mut last_rv: Option<String> = None;
            let mut failure: Option<SourceError> = None;
            for item in batch {
                match item {
                    Ok(ev) => {
                        if let Some(rv) = ev.resource_version() {
                            last_rv = Some(rv.to_string());
                        }
                        match ev {
                            WatchEvent::Added(o) | WatchEvent::Modified(o) => ops.push(Op::Put(o)),
                            WatchEvent::Deleted(o) => ops.push(Op::Delete(o)),
                            WatchEvent::Bookmark(_) => {}
                        }
                    }
                    Err(SourceError::Decode(msg)) => {
                        warn!(mirror = %self.name, error = %msg, "dropping undecodable event");
                        counter!("mirror_decode_errors_total", 1, "mirror" => self.name.clone());
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if !ops.is_empty() || last_rv.is_some() {
                counter!("mirror_events_total", ops.len() as u64, "mirror" => self.name.clone());
                self.store.apply(ops, last_rv.clone());
                gauge!("mirror_store_items", self.store.len() as f64, "mirror" => self.name.clone());
                if last_rv.is_some() {
                    *cursor = last_rv;
                }
            }
            if let Some(e) = failure {
                return self.on_stream_error(e, cursor, backoff).await;
            }
        }
    }

    async fn on_stream_error(&self, e: SourceError, cursor: &mut Option<String>, backoff: &mut Backoff) -> Phase {
        match e {
            SourceError::CursorExpired(msg) => {
                info!(mirror = %self.name, rv = ?cursor, reason = %msg, "cursor expired; relisting");
                counter!("mirror_relists_total", 1, "mirror" => self.name.clone(), "reason" => "expired");
                *cursor = None;
                Phase::Listing
            }
            other => {
                let delay = backoff.next_delay();
                warn!(mirror = %self.name, error = %other, attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "watch failed; resyncing");
                counter!("mirror_relists_total", 1, "mirror" => self.name.clone(), "reason" => "transport");
                if self.sleep(delay).await { Phase::Resyncing } else { Phase::Stopped }
            }
        }
    }

    fn has_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }

    fn mark_synced(&self) {
        let first = self.synced_tx.send_if_modified(|synced| {
            if *synced {
                false
            } else {
                *synced = true;
                true
            }
        });
        if first {
            info!(mirror = %self.name, items = self.store.len(), "mirror synced");
        }
    }

    /// Returns false when cancelled before the delay elapsed.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

async fn resync_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending::<()>().await,
    }
}
