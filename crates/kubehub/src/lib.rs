//! kmirror kubehub: discovery and a list+watch change source over the Kubernetes API.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kmirror::{Mirror, MirrorConfig};
use kmirror_core::{
    namespace_indexer, namespace_key_func, ChangeSource, Indexers, ListPage, Partition, Selector, SourceError,
    WatchEvent, WatchStream,
};
use kube::{
    api::{Api, ListParams, WatchEvent as KubeEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::{debug, info, warn};

/// Longest server-side watch window the API server accepts.
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

/// Parse `"v1/Kind"` or `"group/v1/Kind"`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK against the server's discovery document.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Classify a kube error for the reflector.
pub fn map_kube_error(e: kube::Error) -> SourceError {
    match e {
        kube::Error::Api(ae) if ae.code == 410 || ae.reason == "Expired" || ae.reason == "Gone" => {
            SourceError::CursorExpired(ae.message)
        }
        kube::Error::SerdeError(e) => SourceError::Decode(e.to_string()),
        other => SourceError::Transport(other.to_string()),
    }
}

fn strip_managed_fields(mut obj: DynamicObject) -> DynamicObject {
    obj.metadata.managed_fields = None;
    obj
}

fn convert(ev: KubeEvent<DynamicObject>) -> Result<WatchEvent<DynamicObject>, SourceError> {
    match ev {
        KubeEvent::Added(o) => Ok(WatchEvent::Added(strip_managed_fields(o))),
        KubeEvent::Modified(o) => Ok(WatchEvent::Modified(strip_managed_fields(o))),
        KubeEvent::Deleted(o) => Ok(WatchEvent::Deleted(strip_managed_fields(o))),
        KubeEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
        KubeEvent::Error(ae) => Err(map_kube_error(kube::Error::Api(ae))),
    }
}

/// Change source over one resource kind, backed by the dynamic API.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
    watch_timeout_secs: u32,
}

impl KubeSource {
    pub fn new(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        Self { client, ar, namespaced, watch_timeout_secs: MAX_WATCH_TIMEOUT_SECS }
    }

    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs.clamp(1, MAX_WATCH_TIMEOUT_SECS);
        self
    }

    pub fn api_resource(&self) -> &ApiResource {
        &self.ar
    }

    fn api(&self, partition: &Partition) -> Api<DynamicObject> {
        match (self.namespaced, partition) {
            (true, Partition::Namespace(ns)) => Api::namespaced_with(self.client.clone(), ns, &self.ar),
            _ => Api::all_with(self.client.clone(), &self.ar),
        }
    }
}

#[async_trait::async_trait]
impl ChangeSource<DynamicObject> for KubeSource {
    async fn list(&self, selector: &Selector, partition: &Partition) -> Result<ListPage<DynamicObject>, SourceError> {
        let mut lp = ListParams::default();
        if !selector.is_everything() {
            lp = lp.labels(&selector.to_string());
        }
        let list = self.api(partition).list(&lp).await.map_err(map_kube_error)?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(kind = %self.ar.kind, ns = %partition, count = list.items.len(), rv = %resource_version, "listed");
        Ok(ListPage { items: list.items.into_iter().map(strip_managed_fields).collect(), resource_version })
    }

    async fn watch(&self, cursor: &str, selector: &Selector, partition: &Partition) -> Result<WatchStream<DynamicObject>, SourceError> {
        let mut wp = WatchParams::default().timeout(self.watch_timeout_secs);
        if !selector.is_everything() {
            wp = wp.labels(&selector.to_string());
        }
        let api = self.api(partition);
        let cursor = cursor.to_string();
        let kind = self.ar.kind.clone();
        let stream = async_stream::stream! {
            let events = match api.watch(&wp, &cursor).await {
                Ok(events) => events,
                Err(e) => {
                    yield Err(map_kube_error(e));
                    return;
                }
            };
            debug!(kind = %kind, rv = %cursor, "watch stream open");
            futures::pin_mut!(events);
            while let Some(ev) = events.next().await {
                yield ev.map_err(map_kube_error).and_then(convert);
            }
        };
        Ok(stream.boxed())
    }
}

/// Bootstrap a client from the default kubeconfig and build a mirror for `gvk_key`, scoped to
/// `namespace` when the kind is namespaced.
pub async fn mirror_for(gvk_key: &str, namespace: Option<&str>, selector: Selector) -> Result<Mirror<DynamicObject>> {
    let client = Client::try_default().await.context("loading kubeconfig")?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let partition = if namespaced {
        Partition::from_namespace(namespace)
    } else {
        if namespace.is_some() {
            warn!(gvk = %gvk_key, "kind is cluster-scoped; ignoring namespace");
        }
        Partition::All
    };
    let config = MirrorConfig::from_env();
    let name = format!("generic-{}-lister", ar.plural);
    let source = KubeSource::new(client, ar, namespaced).with_watch_timeout(config.watch_timeout_secs);
    let mut indexers = Indexers::default();
    if namespaced {
        let (index, f) = namespace_indexer::<DynamicObject>();
        indexers.insert(index, f);
    }
    info!(gvk = %gvk_key, ns = %partition, selector = %selector, mirror = %name, "mirror configured");
    Ok(Mirror::new(source, namespace_key_func(), indexers, partition)
        .with_name(name)
        .with_selector(selector)
        .with_config(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmirror_core::Record;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        let ae = serde_json::from_value(serde_json::json!({
            "status": "Failure",
            "message": "too old resource version: 5 (10)",
            "reason": reason,
            "code": code,
        }))
        .unwrap();
        kube::Error::Api(ae)
    }

    #[test]
    fn parses_core_and_grouped_keys() {
        let core = parse_gvk_key("v1/Pod").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "Pod"));
        let apps = parse_gvk_key("apps/v1/Deployment").unwrap();
        assert_eq!(apps.group, "apps");
        assert!(parse_gvk_key("Pod").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("v1/").is_err());
    }

    #[test]
    fn gone_maps_to_cursor_expired() {
        assert!(matches!(map_kube_error(api_error(410, "Expired")), SourceError::CursorExpired(_)));
        assert!(matches!(map_kube_error(api_error(500, "Gone")), SourceError::CursorExpired(_)));
        assert!(matches!(map_kube_error(api_error(403, "Forbidden")), SourceError::Transport(_)));
    }

    #[test]
    fn serde_failures_map_to_decode() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(map_kube_error(kube::Error::SerdeError(bad)), SourceError::Decode(_)));
    }

    #[test]
    fn watch_events_convert_and_strip_managed_fields() {
        let raw = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "coredns",
                "namespace": "kube-system",
                "resourceVersion": "7",
                "labels": {"tier": "kube-system"},
                "managedFields": [{"manager": "kubelet", "operation": "Update"}]
            }
        });
        let obj: DynamicObject = serde_json::from_value(raw).unwrap();
        let ev = convert(KubeEvent::Modified(obj)).unwrap();
        match ev {
            WatchEvent::Modified(o) => {
                assert!(o.metadata.managed_fields.is_none());
                assert_eq!(o.resource_version(), Some("7"));
                assert_eq!(o.label("tier"), Some("kube-system"));
                assert_eq!(namespace_key_func::<DynamicObject>()(&o).unwrap(), "kube-system/coredns");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
