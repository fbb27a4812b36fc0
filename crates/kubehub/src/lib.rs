//! Trellis kubehub: accessor over the Kubernetes API and trait watcher wiring

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use futures::TryStreamExt;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use trellis_core::{AccessError, Accessor, Context, Kind, ObjectKey, Resource, Unstructured};

/// Resolved API endpoint for a kind, plus whether it is namespaced.
#[derive(Debug, Clone)]
struct Endpoint {
    ar: ApiResource,
    namespaced: bool,
}

/// [`Accessor`] for schema-less objects backed by a live cluster.
///
/// Kinds are resolved through API discovery on first use and cached for the
/// accessor's lifetime.
#[derive(Clone)]
pub struct KubeAccessor {
    client: Client,
    endpoints: Arc<RwLock<FxHashMap<Kind, Endpoint>>>,
}

impl KubeAccessor {
    pub fn new(client: Client) -> Self {
        Self { client, endpoints: Arc::new(RwLock::new(FxHashMap::default())) }
    }

    /// Accessor using the ambient kubeconfig or in-cluster config.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn endpoint(&self, kind: &Kind) -> Result<Endpoint, AccessError> {
        if let Some(ep) = self.endpoints.read().await.get(kind) {
            return Ok(ep.clone());
        }
        let gvk = to_gvk(kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| AccessError::Other(anyhow::Error::new(e).context(format!("discovering {}", kind))))?;
        let ep = Endpoint { ar, namespaced: matches!(caps.scope, Scope::Namespaced) };
        debug!(kind = %kind, plural = %ep.ar.plural, namespaced = ep.namespaced, "kind discovered");
        self.endpoints.write().await.insert(kind.clone(), ep.clone());
        Ok(ep)
    }

    async fn api(&self, ctx: &Context, kind: &Kind, key: &ObjectKey) -> Result<Api<DynamicObject>, AccessError> {
        let ep = ctx.guard(self.endpoint(kind)).await??;
        api_for(self.client.clone(), &ep, kind, key.namespace.as_deref())
    }
}

fn api_for(client: Client, ep: &Endpoint, kind: &Kind, namespace: Option<&str>) -> Result<Api<DynamicObject>, AccessError> {
    match (ep.namespaced, namespace) {
        (true, Some(ns)) => Ok(Api::namespaced_with(client, ns, &ep.ar)),
        (true, None) => Err(AccessError::other(format!("{} is namespaced but no namespace was given", kind))),
        (false, _) => Ok(Api::all_with(client, &ep.ar)),
    }
}

fn to_gvk(kind: &Kind) -> GroupVersionKind {
    GroupVersionKind { group: kind.group.clone(), version: kind.version.clone(), kind: kind.kind.clone() }
}

/// Map a kube client error onto the accessor taxonomy.
fn map_err(kind: &Kind, key: &ObjectKey, e: kube::Error) -> AccessError {
    match &e {
        kube::Error::Api(resp) if resp.code == 404 => AccessError::not_found(kind, key),
        kube::Error::Api(resp) if resp.code == 409 => AccessError::conflict(kind, key, resp.message.clone()),
        _ => AccessError::Other(anyhow::Error::new(e).context(format!("{} {}", kind, key))),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Convert a server object to `Unstructured`, filling in type metadata the
/// server may omit.
fn from_dynamic(kind: &Kind, obj: DynamicObject) -> Result<Unstructured, AccessError> {
    let mut raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| kind.api_version().into());
        map.entry("kind").or_insert_with(|| kind.kind.clone().into());
    }
    Ok(Unstructured::from_value(raw)?)
}

fn to_dynamic(obj: &Unstructured) -> Result<DynamicObject, AccessError> {
    let d = serde_json::from_value(obj.value().clone()).context("converting object to DynamicObject")?;
    Ok(d)
}

#[async_trait::async_trait]
impl Accessor<Unstructured> for KubeAccessor {
    async fn get(&self, ctx: &Context, kind: &Kind, key: &ObjectKey) -> Result<Unstructured, AccessError> {
        let api = self.api(ctx, kind, key).await?;
        counter!("kube_requests_total", 1u64, "verb" => "get");
        let obj = ctx.guard(api.get(&key.name)).await?.map_err(|e| map_err(kind, key, e))?;
        from_dynamic(kind, obj)
    }

    async fn update(&self, ctx: &Context, obj: &Unstructured) -> Result<Unstructured, AccessError> {
        let (kind, key) = (obj.kind(), obj.key());
        let api = self.api(ctx, &kind, &key).await?;
        let body = to_dynamic(obj)?;
        counter!("kube_requests_total", 1u64, "verb" => "replace");
        let stored = ctx
            .guard(api.replace(&key.name, &PostParams::default(), &body))
            .await?
            .map_err(|e| map_err(&kind, &key, e))?;
        debug!(kind = %kind, key = %key, rv = ?stored.metadata.resource_version, "object replaced");
        from_dynamic(&kind, stored)
    }

    async fn update_status(&self, ctx: &Context, obj: &Unstructured) -> Result<Unstructured, AccessError> {
        let (kind, key) = (obj.kind(), obj.key());
        let api = self.api(ctx, &kind, &key).await?;
        let body = serde_json::to_vec(obj.value()).context("encoding status body")?;
        counter!("kube_requests_total", 1u64, "verb" => "replace_status");
        let stored = ctx
            .guard(api.replace_status(&key.name, &PostParams::default(), body))
            .await?
            .map_err(|e| map_err(&kind, &key, e))?;
        debug!(kind = %kind, key = %key, rv = ?stored.metadata.resource_version, "status replaced");
        from_dynamic(&kind, stored)
    }
}

fn key_of(obj: &DynamicObject) -> Option<ObjectKey> {
    let name = obj.metadata.name.clone()?;
    Some(ObjectKey { namespace: obj.metadata.namespace.clone(), name })
}

/// List+watch `kind` (optionally limited to one namespace) and send the identity
/// of every applied or deleted object into `tx`. Returns when `ctx` is cancelled,
/// the receiver is dropped, or the watch stream fails.
pub async fn watch_keys(
    accessor: &KubeAccessor,
    ctx: &Context,
    kind: &Kind,
    namespace: Option<&str>,
    tx: mpsc::Sender<ObjectKey>,
) -> anyhow::Result<()> {
    let ep = ctx.guard(accessor.endpoint(kind)).await??;
    let api: Api<DynamicObject> = match (ep.namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(accessor.client.clone(), ns, &ep.ar),
        _ => Api::all_with(accessor.client.clone(), &ep.ar),
    };

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?namespace, "watcher started");
    loop {
        let ev = tokio::select! {
            _ = ctx.cancelled() => {
                debug!(kind = %kind, "watcher cancelled");
                return Ok(());
            }
            ev = stream.try_next() => ev.map_err(|e| anyhow!("watch {}: {}", kind, e))?,
        };
        let Some(ev) = ev else { break };
        let keys: Vec<ObjectKey> = match ev {
            Event::Applied(o) | Event::Deleted(o) => key_of(&o).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                list.iter().filter_map(key_of).collect()
            }
        };
        for key in keys {
            if tx.send(key).await.is_err() {
                debug!(kind = %kind, "identity receiver closed; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}
