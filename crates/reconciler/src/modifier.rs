//! Modification strategies applied to a target on behalf of a trait.

use anyhow::{anyhow, bail, Result};
use serde_json::Value as Json;
use trellis_core::{Context, Resource, Unstructured};

/// Mutates `target` in place according to `tr`. Must not persist anything and must not touch the trait.
#[async_trait::async_trait]
pub trait Modifier<T: Resource, P: Resource>: Send + Sync {
    async fn modify(&self, ctx: &Context, target: &mut P, tr: &T) -> Result<()>;
}

/// Leaves the target untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopModifier;

#[async_trait::async_trait]
impl<T: Resource, P: Resource> Modifier<T, P> for NopModifier {
    async fn modify(&self, _ctx: &Context, _target: &mut P, _tr: &T) -> Result<()> {
        Ok(())
    }
}

/// Adapts a synchronous closure into a [`Modifier`].
pub struct ModifyFn<F>(pub F);

#[async_trait::async_trait]
impl<T, P, F> Modifier<T, P> for ModifyFn<F>
where
    T: Resource,
    P: Resource,
    F: Fn(&mut P, &T) -> Result<()> + Send + Sync,
{
    async fn modify(&self, _ctx: &Context, target: &mut P, tr: &T) -> Result<()> {
        (self.0)(target, tr)
    }
}

/// Applies the trait's patch object (default `spec.patch`) to the target as a JSON merge patch.
#[derive(Debug, Clone)]
pub struct MergePatchModifier {
    path: Vec<String>,
}

impl Default for MergePatchModifier {
    fn default() -> Self {
        Self { path: vec!["spec".into(), "patch".into()] }
    }
}

impl MergePatchModifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_path(mut self, path: &[&str]) -> Self {
        self.path = path.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[async_trait::async_trait]
impl Modifier<Unstructured, Unstructured> for MergePatchModifier {
    async fn modify(&self, _ctx: &Context, target: &mut Unstructured, tr: &Unstructured) -> Result<()> {
        let path: Vec<&str> = self.path.iter().map(String::as_str).collect();
        let patch = tr.get_path(&path).ok_or_else(|| anyhow!("trait has no patch at {}", self.path.join(".")))?;
        if !patch.is_object() {
            bail!("patch at {} must be an object", self.path.join("."));
        }
        let (kind, key) = (target.kind(), target.key());
        merge_patch(target.value_mut(), patch);
        if target.kind() != kind || target.key() != key {
            bail!("patch may not change the identity of {} {}", kind, key);
        }
        Ok(())
    }
}

/// RFC 7386: objects merge recursively, `null` deletes a key, anything else replaces.
pub fn merge_patch(doc: &mut Json, patch: &Json) {
    let Json::Object(patch_obj) = patch else {
        *doc = patch.clone();
        return;
    };
    if !doc.is_object() {
        *doc = Json::Object(serde_json::Map::new());
    }
    if let Json::Object(doc_obj) = doc {
        for (k, pv) in patch_obj {
            if pv.is_null() {
                doc_obj.remove(k);
            } else {
                merge_patch(doc_obj.entry(k.clone()).or_insert(Json::Null), pv);
            }
        }
    }
}
