//! Translation resolvers: find the target a trait governs.

use trellis_core::{Kind, ObjectKey, Resource, ResourceRef, Unstructured};

/// Extract the target reference from a trait. Pure; `None` means "not yet available".
pub trait Resolver<T>: Send + Sync {
    fn resolve(&self, tr: &T) -> Option<ResourceRef>;
}

/// Adapts a plain function or closure into a [`Resolver`].
pub struct ResolveFn<F>(pub F);

impl<T, F> Resolver<T> for ResolveFn<F>
where
    F: Fn(&T) -> Option<ResourceRef> + Send + Sync,
{
    fn resolve(&self, tr: &T) -> Option<ResourceRef> {
        (self.0)(tr)
    }
}

/// Resolves a `{apiVersion, kind, name}` reference embedded in an unstructured trait,
/// by default at `spec.workloadRef`. The target lives in the trait's namespace.
#[derive(Debug, Clone)]
pub struct WorkloadRefResolver {
    path: Vec<String>,
    target_kind: Option<Kind>,
}

impl Default for WorkloadRefResolver {
    fn default() -> Self {
        Self { path: vec!["spec".into(), "workloadRef".into()], target_kind: None }
    }
}

impl WorkloadRefResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_path(mut self, path: &[&str]) -> Self {
        self.path = path.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Always resolve to this kind; only `name` is read from the reference.
    pub fn with_target_kind(mut self, kind: Kind) -> Self {
        self.target_kind = Some(kind);
        self
    }
}

impl Resolver<Unstructured> for WorkloadRefResolver {
    fn resolve(&self, tr: &Unstructured) -> Option<ResourceRef> {
        let path: Vec<&str> = self.path.iter().map(String::as_str).collect();
        let reference = tr.get_path(&path)?;
        let field = |k: &str| reference.get(k).and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        let name = field("name")?;
        let kind = match &self.target_kind {
            Some(k) => k.clone(),
            None => Kind::from_api_version(field("apiVersion")?, field("kind")?),
        };
        let key = ObjectKey { namespace: tr.key().namespace, name: name.to_string() };
        Some(ResourceRef { kind, key })
    }
}
