//! JSON-backed resource usable as a trait or a target of any kind.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{Condition, Conditioned, ConditionedStatus, Kind, ObjectKey, Resource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Unstructured {
    value: Json,
}

impl Unstructured {
    /// Minimal object with `apiVersion`, `kind` and `metadata` set.
    pub fn new(kind: &Kind, key: &ObjectKey) -> Self {
        let mut meta = Map::new();
        meta.insert("name".into(), Json::String(key.name.clone()));
        if let Some(ns) = &key.namespace {
            meta.insert("namespace".into(), Json::String(ns.clone()));
        }
        let value = serde_json::json!({
            "apiVersion": kind.api_version(),
            "kind": kind.kind,
            "metadata": Json::Object(meta),
        });
        Self { value }
    }

    /// Wrap a raw object. Anything other than a JSON object is rejected.
    pub fn from_value(value: Json) -> anyhow::Result<Self> {
        if !value.is_object() {
            anyhow::bail!("resource must be a JSON object");
        }
        Ok(Self { value })
    }

    pub fn value(&self) -> &Json {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Json {
        &mut self.value
    }

    pub fn into_value(self) -> Json {
        self.value
    }

    /// Look up a nested field by path segments.
    pub fn get_path(&self, path: &[&str]) -> Option<&Json> {
        path.iter().try_fold(&self.value, |cur, seg| cur.get(*seg))
    }

    fn str_field(&self, path: &[&str]) -> Option<&str> {
        self.get_path(path).and_then(|v| v.as_str())
    }

    /// Set a nested field, creating intermediate objects as needed.
    pub fn set_path(&mut self, path: &[&str], v: Json) {
        let Some((last, parents)) = path.split_last() else {
            self.value = v;
            return;
        };
        let mut cur = &mut self.value;
        for seg in parents {
            let Some(obj) = cur.as_object_mut() else { return };
            let next = obj.entry((*seg).to_string()).or_insert_with(|| Json::Object(Map::new()));
            if !next.is_object() {
                *next = Json::Object(Map::new());
            }
            cur = next;
        }
        if let Some(obj) = cur.as_object_mut() {
            obj.insert((*last).to_string(), v);
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.str_field(&["metadata", "uid"])
    }

    /// Conditions parsed from `status.conditions`. Entries that do not parse are skipped.
    pub fn conditioned_status(&self) -> ConditionedStatus {
        let mut out = ConditionedStatus::default();
        if let Some(items) = self.get_path(&["status", "conditions"]).and_then(|v| v.as_array()) {
            let parsed = items.iter().filter_map(|c| serde_json::from_value::<Condition>(c.clone()).ok());
            out.set_conditions(parsed);
        }
        out
    }
}

impl Resource for Unstructured {
    fn kind(&self) -> Kind {
        Kind::from_api_version(
            self.str_field(&["apiVersion"]).unwrap_or_default(),
            self.str_field(&["kind"]).unwrap_or_default(),
        )
    }

    fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.str_field(&["metadata", "namespace"]).map(|s| s.to_string()),
            name: self.str_field(&["metadata", "name"]).unwrap_or_default().to_string(),
        }
    }

    fn resource_version(&self) -> Option<String> {
        self.str_field(&["metadata", "resourceVersion"]).map(|s| s.to_string())
    }

    fn set_resource_version(&mut self, rv: Option<String>) {
        match rv {
            Some(rv) => self.set_path(&["metadata", "resourceVersion"], Json::String(rv)),
            None => {
                if let Some(meta) = self.value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    meta.remove("resourceVersion");
                }
            }
        }
    }
}

impl Conditioned for Unstructured {
    fn get_condition(&self, ty: &str) -> Condition {
        self.conditioned_status().get_condition(ty)
    }

    /// Edits `status.conditions` in place. Entries of other types are copied through
    /// verbatim, whether or not they parse as a [`Condition`].
    fn set_condition(&mut self, c: Condition) -> bool {
        let existing = self.get_path(&["status", "conditions"]).and_then(|v| v.as_array());
        let pos = existing.and_then(|items| items.iter().position(|e| e.get("type").and_then(Json::as_str) == Some(c.ty.as_str())));
        if let (Some(items), Some(i)) = (existing, pos) {
            if same_condition(&items[i], &c) {
                return false;
            }
        }
        let mut items = existing.cloned().unwrap_or_default();
        let Ok(fresh) = serde_json::to_value(&c) else { return false };
        match pos {
            Some(i) => items[i] = fresh,
            None => items.push(fresh),
        }
        self.set_path(&["status", "conditions"], Json::Array(items));
        true
    }
}

/// Type, status, reason and message match; everything else is ignored.
fn same_condition(raw: &Json, c: &Condition) -> bool {
    let field = |k: &str| raw.get(k).and_then(Json::as_str);
    field("type") == Some(c.ty.as_str())
        && field("status") == Some(c.status.to_string().as_str())
        && field("reason").unwrap_or_default() == c.reason
        && field("message") == c.message.as_deref()
}
