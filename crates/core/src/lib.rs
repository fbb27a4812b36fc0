//! Trellis core types: resource identity, capability traits, conditions and
//! the accessor interface the reconcile engine is written against.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod condition;
pub mod context;
pub mod error;
pub mod unstructured;

pub use condition::{Condition, ConditionStatus, ConditionedStatus};
pub use context::Context;
pub use error::AccessError;
pub use unstructured::Unstructured;

pub mod prelude {
    pub use super::{
        Accessor, AccessError, Condition, ConditionStatus, Conditioned, ConditionedStatus, Context, Kind, ObjectKey,
        Resource, ResourceRef, Unstructured,
    };
}

/// Group/Version/Kind of a resource stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Kind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Kind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Parse a gvk key of the form `v1/Kind` or `group/v1/Kind`.
    pub fn parse(key: &str) -> Result<Self, AccessError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*group, *version, *kind))
            }
            _ => Err(AccessError::other(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }

    /// Build a kind from an object's `apiVersion` and `kind` fields.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Namespace + name of an object. Cluster-scoped objects have no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Fully qualified reference: which kind, and which object of that kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: Kind,
    pub key: ObjectKey,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

/// Anything addressable by (kind, namespace, name) and carrying a resource version.
pub trait Resource: Clone + Send + Sync + 'static {
    fn kind(&self) -> Kind;
    fn key(&self) -> ObjectKey;
    /// Opaque version used for optimistic concurrency; `None` for objects never persisted.
    fn resource_version(&self) -> Option<String>;
    fn set_resource_version(&mut self, rv: Option<String>);
}

/// Anything that can report and accept status conditions.
pub trait Conditioned: Resource {
    /// Current condition of the given type, or an `Unknown` placeholder.
    fn get_condition(&self, ty: &str) -> Condition;

    /// Set a condition with set-if-changed semantics. Returns true if anything changed.
    fn set_condition(&mut self, c: Condition) -> bool;
}

/// Narrow read/write interface over the object store.
///
/// Implementations must report a missing object as [`AccessError::NotFound`] and a
/// write against a stale resource version as [`AccessError::Conflict`].
#[async_trait::async_trait]
pub trait Accessor<O: Resource>: Send + Sync {
    async fn get(&self, ctx: &Context, kind: &Kind, key: &ObjectKey) -> Result<O, AccessError>;

    /// Replace the object's non-status content. Returns the stored object (new resource version).
    async fn update(&self, ctx: &Context, obj: &O) -> Result<O, AccessError>;

    /// Replace the object's status. Returns the stored object (new resource version).
    async fn update_status(&self, ctx: &Context, obj: &O) -> Result<O, AccessError>;
}

#[async_trait::async_trait]
impl<O, A> Accessor<O> for std::sync::Arc<A>
where
    O: Resource,
    A: Accessor<O> + ?Sized,
{
    async fn get(&self, ctx: &Context, kind: &Kind, key: &ObjectKey) -> Result<O, AccessError> {
        (**self).get(ctx, kind, key).await
    }

    async fn update(&self, ctx: &Context, obj: &O) -> Result<O, AccessError> {
        (**self).update(ctx, obj).await
    }

    async fn update_status(&self, ctx: &Context, obj: &O) -> Result<O, AccessError> {
        (**self).update_status(ctx, obj).await
    }
}
