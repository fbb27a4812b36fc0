//! Trellis reconciler: the generic trait reconcile engine.
//!
//! One reconcile attempt reads a trait, resolves the target it governs, lets a
//! [`Modifier`] mutate that target, writes the target back and records the outcome
//! on the trait's `Synced` condition. Failures after the trait is loaded are recorded
//! on the trait and retried after a short fixed wait instead of being returned.

#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;
use trellis_core::{AccessError, Accessor, Condition, Conditioned, Context, Kind, ObjectKey, Resource, Unstructured};

pub mod modifier;
pub mod resolver;

pub use modifier::{MergePatchModifier, ModifyFn, Modifier, NopModifier};
pub use resolver::{ResolveFn, Resolver, WorkloadRefResolver};

pub const ERR_GET_TRAIT: &str = "cannot get trait";
pub const ERR_GET_TRANSLATION: &str = "cannot get translation for workload reference in trait";
pub const ERR_TRAIT_MODIFY: &str = "cannot apply trait modification";
pub const ERR_APPLY_MODIFICATION: &str = "cannot apply modified translation";
pub const ERR_UPDATE_TRAIT_STATUS: &str = "cannot update trait status";

const DEFAULT_SHORT_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity of the trait to reconcile. The kind is fixed per reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub key: ObjectKey,
}

impl From<ObjectKey> for Request {
    fn from(key: ObjectKey) -> Self {
        Self { key }
    }
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    /// Steady state; only an external change triggers the next attempt.
    pub fn done() -> Self {
        Self { requeue_after: None }
    }

    pub fn requeue_after(after: Duration) -> Self {
        Self { requeue_after: Some(after) }
    }
}

/// Errors the engine cannot record on the trait and hands back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("cannot get trait: {0}")]
    GetTrait(AccessError),
    #[error("cannot update trait status: {0}")]
    UpdateStatus(AccessError),
}

impl ReconcileError {
    pub fn access_error(&self) -> &AccessError {
        match self {
            Self::GetTrait(e) | Self::UpdateStatus(e) => e,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerOptions {
    /// Delay before retrying an expected-transient state.
    pub short_wait: Duration,
    /// Upper bound on one reconcile attempt, all steps included.
    pub reconcile_timeout: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self { short_wait: DEFAULT_SHORT_WAIT, reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT }
    }
}

impl ReconcilerOptions {
    /// Defaults overridden by `TRELLIS_SHORT_WAIT_SECS` and `TRELLIS_RECONCILE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let secs = |var: &str| std::env::var(var).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs);
        Self {
            short_wait: secs("TRELLIS_SHORT_WAIT_SECS").unwrap_or(DEFAULT_SHORT_WAIT),
            reconcile_timeout: secs("TRELLIS_RECONCILE_TIMEOUT_SECS").unwrap_or(DEFAULT_RECONCILE_TIMEOUT),
        }
    }
}

/// Anything a dispatcher can drive.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, ctx: &Context, req: &Request) -> Result<Outcome, ReconcileError>;
}

/// Engine over schema-less resources, as used against a live cluster.
pub type UnstructuredReconciler<A, R, M = NopModifier> = Reconciler<Unstructured, Unstructured, A, R, M>;

/// Reconciles traits of kind `trait_kind` (type `T`) against targets of type `P`.
pub struct Reconciler<T, P, A, R, M = NopModifier> {
    accessor: A,
    trait_kind: Kind,
    resolver: R,
    modifier: M,
    options: ReconcilerOptions,
    _objects: PhantomData<fn() -> (T, P)>,
}

impl<T, P, A, R> Reconciler<T, P, A, R, NopModifier> {
    pub fn new(accessor: A, trait_kind: Kind, resolver: R) -> Self {
        Self {
            accessor,
            trait_kind,
            resolver,
            modifier: NopModifier,
            options: ReconcilerOptions::default(),
            _objects: PhantomData,
        }
    }
}

impl<T, P, A, R, M> Reconciler<T, P, A, R, M> {
    pub fn with_modifier<M2>(self, modifier: M2) -> Reconciler<T, P, A, R, M2> {
        Reconciler {
            accessor: self.accessor,
            trait_kind: self.trait_kind,
            resolver: self.resolver,
            modifier,
            options: self.options,
            _objects: PhantomData,
        }
    }

    pub fn with_options(mut self, options: ReconcilerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_short_wait(mut self, short_wait: Duration) -> Self {
        self.options.short_wait = short_wait;
        self
    }

    pub fn options(&self) -> &ReconcilerOptions {
        &self.options
    }

    pub fn trait_kind(&self) -> &Kind {
        &self.trait_kind
    }
}

impl<T, P, A, R, M> Reconciler<T, P, A, R, M>
where
    T: Conditioned,
    P: Resource + PartialEq,
    A: Accessor<T> + Accessor<P>,
    R: Resolver<T>,
    M: Modifier<T, P>,
{
    /// Run one reconcile attempt for the trait named by `req`.
    pub async fn reconcile_once(&self, ctx: &Context, req: &Request) -> Result<Outcome, ReconcileError> {
        let started = Instant::now();
        let ctx = ctx.with_timeout(self.options.reconcile_timeout);
        let res = self.run(&ctx, &req.key).await;
        let result = match &res {
            Ok(Step::Gone) => "gone",
            Ok(Step::Pending) => "pending",
            Ok(Step::Absorbed) => "absorbed",
            Ok(Step::Synced) => "synced",
            Err(_) => "error",
        };
        counter!("trait_reconcile_total", 1u64, "result" => result);
        histogram!("trait_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(kind = %self.trait_kind, key = %req.key, result, "reconcile finished");
        res.map(|step| match step {
            Step::Gone | Step::Synced => Outcome::done(),
            Step::Pending | Step::Absorbed => Outcome::requeue_after(self.options.short_wait),
        })
    }

    async fn run(&self, ctx: &Context, key: &ObjectKey) -> Result<Step, ReconcileError> {
        let mut tr: T = match ctx.guard(Accessor::<T>::get(&self.accessor, ctx, &self.trait_kind, key)).await {
            Ok(Ok(tr)) => tr,
            Ok(Err(e)) | Err(e) if e.is_not_found() => {
                debug!(kind = %self.trait_kind, key = %key, "trait not found; nothing to do");
                return Ok(Step::Gone);
            }
            Ok(Err(e)) | Err(e) => return Err(ReconcileError::GetTrait(e)),
        };

        let Some(target_ref) = self.resolver.resolve(&tr) else {
            debug!(kind = %self.trait_kind, key = %key, "translation not yet available");
            return Ok(Step::Pending);
        };

        let fetched = ctx.guard(Accessor::<P>::get(&self.accessor, ctx, &target_ref.kind, &target_ref.key)).await;
        let mut target: P = match fetched.and_then(|r| r) {
            Ok(p) => p,
            Err(e) => return self.absorb(ctx, &mut tr, anyhow::Error::new(e).context(ERR_GET_TRANSLATION)).await,
        };

        let before = target.clone();
        let modified = ctx.guard(self.modifier.modify(ctx, &mut target, &tr)).await;
        if let Err(e) = modified.map_err(anyhow::Error::new).and_then(|r| r) {
            return self.absorb(ctx, &mut tr, e.context(ERR_TRAIT_MODIFY)).await;
        }

        if target != before {
            let written = ctx.guard(Accessor::<P>::update(&self.accessor, ctx, &target)).await;
            if let Err(e) = written.and_then(|r| r) {
                return self.absorb(ctx, &mut tr, anyhow::Error::new(e).context(ERR_APPLY_MODIFICATION)).await;
            }
            debug!(target_ref = %target_ref, "target updated");
        } else {
            debug!(target_ref = %target_ref, "target unchanged; skipping write");
        }

        self.record(ctx, &mut tr, Condition::reconcile_success()).await?;
        Ok(Step::Synced)
    }

    /// Record a step failure on the trait and ask for a short requeue.
    async fn absorb(&self, ctx: &Context, tr: &mut T, err: anyhow::Error) -> Result<Step, ReconcileError> {
        debug!(kind = %self.trait_kind, key = %tr.key(), error = %format!("{:#}", err), "reconcile step failed");
        self.record(ctx, tr, Condition::reconcile_error(&err)).await?;
        Ok(Step::Absorbed)
    }

    /// Set a condition and write the status, unless the condition set is unchanged.
    async fn record(&self, ctx: &Context, tr: &mut T, c: Condition) -> Result<(), ReconcileError> {
        if !tr.set_condition(c) {
            debug!(kind = %self.trait_kind, key = %tr.key(), "conditions unchanged; skipping status write");
            return Ok(());
        }
        let written = ctx.guard(Accessor::<T>::update_status(&self.accessor, ctx, tr)).await;
        written.and_then(|r| r).map_err(ReconcileError::UpdateStatus)?;
        counter!("trait_status_writes_total", 1u64);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T, P, A, R, M> Reconcile for Reconciler<T, P, A, R, M>
where
    T: Conditioned,
    P: Resource + PartialEq,
    A: Accessor<T> + Accessor<P>,
    R: Resolver<T>,
    M: Modifier<T, P>,
{
    async fn reconcile(&self, ctx: &Context, req: &Request) -> Result<Outcome, ReconcileError> {
        self.reconcile_once(ctx, req).await
    }
}

/// Where an attempt stopped.
enum Step {
    Gone,
    Pending,
    Absorbed,
    Synced,
}
