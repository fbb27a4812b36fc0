//! Trellis store: in-RAM object store implementing the accessor interface.
//!
//! Objects are kept as raw JSON keyed by (kind, namespace, name). Every write bumps
//! a store-wide resource version; writes carrying a stale version fail with a conflict.

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use anyhow::{Context as _, Result};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use tokio::sync::Mutex;
use tracing::debug;
use trellis_core::{AccessError, Accessor, Context, Kind, ObjectKey, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Update,
    UpdateStatus,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Get => "get",
            Op::Update => "update",
            Op::UpdateStatus => "update_status",
        }
    }
}

type Slot = (Kind, ObjectKey);

struct Entry {
    rv: u64,
    raw: Json,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<Slot, Entry>,
    next_rv: u64,
    faults: FxHashMap<(Op, Kind), VecDeque<String>>,
    writes: FxHashMap<(Op, Slot), u64>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_rv = self.next_rv.saturating_add(1);
        self.next_rv
    }

    fn take_fault(&mut self, op: Op, kind: &Kind) -> Option<AccessError> {
        let queue = self.faults.get_mut(&(op, kind.clone()))?;
        let msg = queue.pop_front()?;
        Some(AccessError::other(msg))
    }

    fn count_write(&mut self, op: Op, slot: Slot) {
        *self.writes.entry((op, slot)).or_insert(0) += 1;
        counter!("store_writes_total", 1u64, "op" => op.as_str());
    }
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite an object as an external actor would. Returns it with its new resource version.
    pub async fn insert<O: Resource + Serialize + DeserializeOwned>(&self, obj: &O) -> Result<O> {
        let mut raw = serde_json::to_value(obj).context("serializing object")?;
        let slot = (obj.kind(), obj.key());
        let mut inner = self.inner.lock().await;
        let rv = inner.bump();
        set_rv(&mut raw, rv);
        let out = serde_json::from_value(raw.clone()).context("deserializing stored object")?;
        debug!(kind = %slot.0, key = %slot.1, rv, "object inserted");
        inner.objects.insert(slot, Entry { rv, raw });
        Ok(out)
    }

    /// Insert a raw JSON object; identity is read from its `apiVersion`, `kind` and `metadata`.
    pub async fn insert_raw(&self, raw: Json) -> Result<()> {
        let obj = trellis_core::Unstructured::from_value(raw)?;
        self.insert(&obj).await.map(|_| ())
    }

    pub async fn remove(&self, kind: &Kind, key: &ObjectKey) -> bool {
        self.inner.lock().await.objects.remove(&(kind.clone(), key.clone())).is_some()
    }

    /// Raw stored JSON, including the store-assigned `metadata.resourceVersion`.
    pub async fn raw(&self, kind: &Kind, key: &ObjectKey) -> Option<Json> {
        self.inner.lock().await.objects.get(&(kind.clone(), key.clone())).map(|e| e.raw.clone())
    }

    /// Make the next `op` against `kind` fail with `message`. Faults queue up and fire once each.
    pub async fn inject_fault(&self, op: Op, kind: &Kind, message: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        inner.faults.entry((op, kind.clone())).or_default().push_back(message.into());
    }

    /// Number of successful writes of `op` against one object.
    pub async fn writes(&self, op: Op, kind: &Kind, key: &ObjectKey) -> u64 {
        let inner = self.inner.lock().await;
        inner.writes.get(&(op, (kind.clone(), key.clone()))).copied().unwrap_or(0)
    }

    async fn write<O>(&self, ctx: &Context, obj: &O, op: Op) -> Result<O, AccessError>
    where
        O: Resource + Serialize + DeserializeOwned,
    {
        if let Some(e) = ctx.err() {
            return Err(e);
        }
        let kind = obj.kind();
        let key = obj.key();
        let incoming = serde_json::to_value(obj).context("serializing object")?;
        let mut inner = self.inner.lock().await;
        if let Some(e) = inner.take_fault(op, &kind) {
            return Err(e);
        }
        let slot = (kind.clone(), key.clone());
        let current_rv = match inner.objects.get(&slot) {
            Some(e) => e.rv,
            None => return Err(AccessError::not_found(&kind, &key)),
        };
        if let Some(rv) = obj.resource_version() {
            if rv != current_rv.to_string() {
                return Err(AccessError::conflict(
                    &kind,
                    &key,
                    format!("the object has been modified (resourceVersion {} != {})", rv, current_rv),
                ));
            }
        }
        let next_rv = inner.bump();
        let Some(entry) = inner.objects.get_mut(&slot) else {
            return Err(AccessError::not_found(&kind, &key));
        };
        let mut merged = match op {
            Op::UpdateStatus => with_status_of(entry.raw.clone(), &incoming),
            _ => with_status_of(incoming, &entry.raw),
        };
        set_rv(&mut merged, next_rv);
        entry.rv = next_rv;
        entry.raw = merged.clone();
        inner.count_write(op, slot);
        debug!(kind = %kind, key = %key, rv = next_rv, op = op.as_str(), "object written");
        Ok(serde_json::from_value(merged).context("deserializing stored object")?)
    }
}

#[async_trait::async_trait]
impl<O> Accessor<O> for MemStore
where
    O: Resource + Serialize + DeserializeOwned,
{
    async fn get(&self, ctx: &Context, kind: &Kind, key: &ObjectKey) -> Result<O, AccessError> {
        if let Some(e) = ctx.err() {
            return Err(e);
        }
        let mut inner = self.inner.lock().await;
        if let Some(e) = inner.take_fault(Op::Get, kind) {
            return Err(e);
        }
        let entry = inner
            .objects
            .get(&(kind.clone(), key.clone()))
            .ok_or_else(|| AccessError::not_found(kind, key))?;
        Ok(serde_json::from_value(entry.raw.clone()).context("deserializing stored object")?)
    }

    async fn update(&self, ctx: &Context, obj: &O) -> Result<O, AccessError> {
        self.write(ctx, obj, Op::Update).await
    }

    async fn update_status(&self, ctx: &Context, obj: &O) -> Result<O, AccessError> {
        self.write(ctx, obj, Op::UpdateStatus).await
    }
}

/// `base` with its `status` replaced by the one in `from` (removed if `from` has none).
fn with_status_of(mut base: Json, from: &Json) -> Json {
    if let Some(obj) = base.as_object_mut() {
        match from.get("status") {
            Some(s) => {
                obj.insert("status".into(), s.clone());
            }
            None => {
                obj.remove("status");
            }
        }
    }
    base
}

fn set_rv(raw: &mut Json, rv: u64) {
    if let Some(obj) = raw.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
        }
    }
}
