//! [`RemoteStore`] backed by a Kubernetes API server through kube-rs.
//!
//! Kinds are group/version/kind keys (`v1/Pod`, `apps/v1/Deployment`) resolved
//! to API resources through discovery once and then cached.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use tern_core::{Snapshot, TransportError};
use tracing::{debug, info, warn};

use crate::{Listing, RemoteEvent, RemoteStore, WatchStream};

/// Server-side watch timeout; the stream ends cleanly after this and is reopened.
const WATCH_TIMEOUT_SECS: u32 = 290;

pub struct KubeStore {
    client: Client,
    namespace: Option<String>,
    label_selector: Option<String>,
    resolved: Mutex<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, namespace: None, label_selector: None, resolved: Mutex::new(FxHashMap::default()) }
    }

    /// Connect using the local kubeconfig, falling back to the in-cluster service account.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    /// Restrict namespaced kinds to one namespace.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|s| !s.is_empty());
        self
    }

    pub fn with_label_selector(mut self, selector: Option<String>) -> Self {
        self.label_selector = selector.filter(|s| !s.is_empty());
        self
    }

    async fn api(&self, kind: &str) -> Result<Api<DynamicObject>, TransportError> {
        let cached = self.resolved.lock().unwrap_or_else(|e| e.into_inner()).get(kind).cloned();
        let (ar, namespaced) = match cached {
            Some(found) => found,
            None => {
                let gvk = parse_gvk_key(kind).map_err(|e| TransportError::Transient(e.to_string()))?;
                let found = find_api_resource(self.client.clone(), &gvk).await?;
                info!(kind = %kind, plural = %found.0.plural, namespaced = found.1, "resolved api resource");
                self.resolved.lock().unwrap_or_else(|e| e.into_inner()).insert(kind.to_string(), found.clone());
                found
            }
        };
        Ok(match (&self.namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), TransportError> {
    let discovery = Discovery::new(client).run().await.map_err(classify)?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(TransportError::Transient(format!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}

/// Map kube errors onto the retry taxonomy: 410 means relist, 401/403 are auth.
fn classify(e: kube::Error) -> TransportError {
    match e {
        kube::Error::Api(ae) if ae.code == 410 => TransportError::Gone(ae.message),
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => TransportError::Unauthorized(ae.message),
        other => TransportError::Transient(other.to_string()),
    }
}

fn snapshot_from(kind: &str, obj: &DynamicObject) -> anyhow::Result<Snapshot> {
    let raw = serde_json::to_value(obj)?;
    Ok(Snapshot::from_value(kind, raw)?)
}

/// Malformed objects are skipped rather than failing the whole listing or stream.
fn usable(kind: &str, res: anyhow::Result<Snapshot>) -> Option<Snapshot> {
    match res {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(kind = %kind, error = %e, "skipping malformed object");
            None
        }
    }
}

#[async_trait]
impl RemoteStore for KubeStore {
    async fn list(&self, kind: &str) -> Result<Listing, TransportError> {
        let api = self.api(kind).await?;
        let mut lp = ListParams::default();
        if let Some(sel) = self.label_selector.as_deref() {
            lp = lp.labels(sel);
        }
        let list = api.list(&lp).await.map_err(classify)?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let items: Vec<Snapshot> = list.items.iter().filter_map(|o| usable(kind, snapshot_from(kind, o))).collect();
        debug!(kind = %kind, count = items.len(), rv = %resource_version, "list ok");
        Ok(Listing { resource_version, items })
    }

    async fn watch(&self, kind: &str, from: &str) -> Result<WatchStream, TransportError> {
        let api = self.api(kind).await?;
        let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(sel) = self.label_selector.as_deref() {
            wp = wp.labels(sel);
        }
        let stream = api.watch(&wp, from).await.map_err(classify)?;
        let kind = kind.to_string();
        Ok(stream
            .filter_map(move |ev| {
                let out = match ev {
                    Ok(WatchEvent::Added(o)) => usable(&kind, snapshot_from(&kind, &o)).map(|s| Ok(RemoteEvent::Added(s))),
                    Ok(WatchEvent::Modified(o)) => {
                        usable(&kind, snapshot_from(&kind, &o)).map(|s| Ok(RemoteEvent::Modified(s)))
                    }
                    Ok(WatchEvent::Deleted(o)) => {
                        usable(&kind, snapshot_from(&kind, &o)).map(|s| Ok(RemoteEvent::Deleted(s)))
                    }
                    Ok(WatchEvent::Bookmark(b)) => Some(Ok(RemoteEvent::Bookmark(b.metadata.resource_version))),
                    Ok(WatchEvent::Error(e)) if e.code == 410 => Some(Err(TransportError::Gone(e.message))),
                    Ok(WatchEvent::Error(e)) => Some(Err(TransportError::Transient(e.message))),
                    Err(e) => Some(Err(classify(e))),
                };
                futures::future::ready(out)
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys() {
        let core = parse_gvk_key("v1/Pod").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "Pod"));
        let apps = parse_gvk_key("apps/v1/Deployment").unwrap();
        assert_eq!(apps.group, "apps");
        assert!(parse_gvk_key("Pod").is_err());
    }

    #[test]
    fn classifies_api_errors() {
        let api_err = |code: u16| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: format!("code {code}"),
                reason: String::new(),
                code,
            })
        };
        assert!(classify(api_err(410)).is_gone());
        assert!(matches!(classify(api_err(403)), TransportError::Unauthorized(_)));
        assert!(matches!(classify(api_err(500)), TransportError::Transient(_)));
    }
}
