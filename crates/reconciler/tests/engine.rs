#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use trellis_core::condition::{REASON_RECONCILE_ERROR, REASON_RECONCILE_SUCCESS, TYPE_SYNCED};
use trellis_core::{AccessError, ConditionStatus, Conditioned, Context, Kind, ObjectKey, Resource, Unstructured};
use trellis_reconciler::{
    MergePatchModifier, ModifyFn, Modifier, Outcome, ReconcileError, Reconciler, Request, UnstructuredReconciler,
    WorkloadRefResolver, ERR_APPLY_MODIFICATION, ERR_GET_TRANSLATION, ERR_TRAIT_MODIFY,
};
use trellis_store::{MemStore, Op};

const SHORT: Duration = Duration::from_millis(250);

fn trait_kind() -> Kind {
    Kind::new("core.oam.dev", "v1alpha2", "PatchTrait")
}

fn deploy_kind() -> Kind {
    Kind::new("apps", "v1", "Deployment")
}

fn trait_key() -> ObjectKey {
    ObjectKey::namespaced("demo", "web-patch")
}

fn target_key() -> ObjectKey {
    ObjectKey::namespaced("demo", "web")
}

fn patch_trait(with_ref: bool) -> serde_json::Value {
    let mut spec = serde_json::json!({ "patch": { "spec": { "replicas": 3 } } });
    if with_ref {
        spec["workloadRef"] = serde_json::json!({ "apiVersion": "apps/v1", "kind": "Deployment", "name": "web" });
    }
    serde_json::json!({
        "apiVersion": "core.oam.dev/v1alpha2",
        "kind": "PatchTrait",
        "metadata": { "name": "web-patch", "namespace": "demo" },
        "spec": spec
    })
}

fn deployment() -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": "web", "namespace": "demo" },
        "spec": { "replicas": 1 }
    })
}

fn reconciler(store: &Arc<MemStore>) -> UnstructuredReconciler<Arc<MemStore>, WorkloadRefResolver, MergePatchModifier> {
    Reconciler::new(Arc::clone(store), trait_kind(), WorkloadRefResolver::new())
        .with_modifier(MergePatchModifier::new())
        .with_short_wait(SHORT)
}

async fn stored_trait(store: &MemStore) -> Unstructured {
    let raw = store.raw(&trait_kind(), &trait_key()).await.expect("trait stored");
    Unstructured::from_value(raw).unwrap()
}

async fn status_writes(store: &MemStore) -> u64 {
    store.writes(Op::UpdateStatus, &trait_kind(), &trait_key()).await
}

async fn target_writes(store: &MemStore) -> u64 {
    store.writes(Op::Update, &deploy_kind(), &target_key()).await
}

fn req() -> Request {
    Request::from(trait_key())
}

#[tokio::test]
async fn trait_not_found_is_silent_success() {
    let store = Arc::new(MemStore::new());
    let got = reconciler(&store).reconcile_once(&Context::background(), &req()).await.expect("no error");
    assert_eq!(got, Outcome::done());
}

#[tokio::test]
async fn get_trait_error_is_propagated_without_status_write() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    store.inject_fault(Op::Get, &trait_kind(), "boom").await;

    let err = reconciler(&store).reconcile_once(&Context::background(), &req()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::GetTrait(_)));
    assert_eq!(err.to_string(), "cannot get trait: boom");
    assert_eq!(status_writes(&store).await, 0);
}

#[tokio::test]
async fn pending_translation_requeues_without_touching_conditions() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(false)).await.unwrap();
    let before = stored_trait(&store).await;

    let got = reconciler(&store).reconcile_once(&Context::background(), &req()).await.expect("no error");
    assert_eq!(got, Outcome::requeue_after(SHORT));
    assert_eq!(stored_trait(&store).await, before);
    assert_eq!(status_writes(&store).await, 0);
}

#[tokio::test]
async fn missing_target_is_recorded_and_requeued() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();

    let got = reconciler(&store).reconcile_once(&Context::background(), &req()).await.expect("absorbed");
    assert_eq!(got, Outcome::requeue_after(SHORT));

    let synced = stored_trait(&store).await.get_condition(TYPE_SYNCED);
    assert_eq!(synced.status, ConditionStatus::False);
    assert_eq!(synced.reason, REASON_RECONCILE_ERROR);
    assert_eq!(
        synced.message.as_deref(),
        Some(format!("{}: apps/v1/Deployment \"demo/web\" not found", ERR_GET_TRANSLATION).as_str())
    );
}

#[tokio::test]
async fn get_target_error_is_absorbed() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    store.insert_raw(deployment()).await.unwrap();
    store.inject_fault(Op::Get, &deploy_kind(), "boom").await;

    let got = reconciler(&store).reconcile_once(&Context::background(), &req()).await.expect("absorbed");
    assert_eq!(got, Outcome::requeue_after(SHORT));
    let synced = stored_trait(&store).await.get_condition(TYPE_SYNCED);
    assert_eq!(synced.message.as_deref(), Some(format!("{}: boom", ERR_GET_TRANSLATION).as_str()));
    assert_eq!(target_writes(&store).await, 0);
}

#[tokio::test]
async fn modifier_error_is_absorbed() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    store.insert_raw(deployment()).await.unwrap();

    let r = reconciler(&store)
        .with_modifier(ModifyFn(|_: &mut Unstructured, _: &Unstructured| -> anyhow::Result<()> { Err(anyhow::anyhow!("boom")) }));
    let got = r.reconcile_once(&Context::background(), &req()).await.expect("absorbed");
    assert_eq!(got, Outcome::requeue_after(SHORT));

    let synced = stored_trait(&store).await.get_condition(TYPE_SYNCED);
    assert_eq!(synced.status, ConditionStatus::False);
    assert_eq!(synced.reason, REASON_RECONCILE_ERROR);
    assert_eq!(synced.message.as_deref(), Some(format!("{}: boom", ERR_TRAIT_MODIFY).as_str()));
    assert_eq!(target_writes(&store).await, 0);
}

#[tokio::test]
async fn persist_error_is_absorbed() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    store.insert_raw(deployment()).await.unwrap();
    store.inject_fault(Op::Update, &deploy_kind(), "boom").await;

    let got = reconciler(&store).reconcile_once(&Context::background(), &req()).await.expect("absorbed");
    assert_eq!(got, Outcome::requeue_after(SHORT));
    let synced = stored_trait(&store).await.get_condition(TYPE_SYNCED);
    assert_eq!(synced.message.as_deref(), Some(format!("{}: boom", ERR_APPLY_MODIFICATION).as_str()));
}

/// Bumps the target behind the engine's back before mutating its copy.
struct RacingModifier {
    store: Arc<MemStore>,
}

#[async_trait::async_trait]
impl Modifier<Unstructured, Unstructured> for RacingModifier {
    async fn modify(&self, _ctx: &Context, target: &mut Unstructured, _tr: &Unstructured) -> anyhow::Result<()> {
        let mut external = target.clone();
        external.set_path(&["metadata", "labels"], serde_json::json!({ "owner": "someone-else" }));
        self.store.insert(&external).await?;
        target.set_path(&["spec", "replicas"], serde_json::json!(3));
        Ok(())
    }
}

#[tokio::test]
async fn concurrent_target_write_conflicts_and_is_absorbed() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    store.insert_raw(deployment()).await.unwrap();

    let r = reconciler(&store).with_modifier(RacingModifier { store: Arc::clone(&store) });
    let got = r.reconcile_once(&Context::background(), &req()).await.expect("absorbed");
    assert_eq!(got, Outcome::requeue_after(SHORT));

    let synced = stored_trait(&store).await.get_condition(TYPE_SYNCED);
    let msg = synced.message.unwrap_or_default();
    assert!(msg.starts_with(ERR_APPLY_MODIFICATION), "msg={}", msg);
    assert!(msg.contains("conflict"), "msg={}", msg);
    // the external write survives
    let raw = store.raw(&deploy_kind(), &target_key()).await.unwrap();
    assert_eq!(raw["metadata"]["labels"]["owner"], "someone-else");
    assert_eq!(raw["spec"]["replicas"], 1);
}

#[tokio::test]
async fn success_writes_target_and_status_once() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    store.insert_raw(deployment()).await.unwrap();

    let got = reconciler(&store).reconcile_once(&Context::background(), &req()).await.expect("synced");
    assert_eq!(got, Outcome::done());

    let raw = store.raw(&deploy_kind(), &target_key()).await.unwrap();
    assert_eq!(raw["spec"]["replicas"], 3);
    assert_eq!(target_writes(&store).await, 1);
    assert_eq!(status_writes(&store).await, 1);

    let synced = stored_trait(&store).await.get_condition(TYPE_SYNCED);
    assert_eq!(synced.status, ConditionStatus::True);
    assert_eq!(synced.reason, REASON_RECONCILE_SUCCESS);
    assert!(synced.message.is_none());
}

#[tokio::test]
async fn reconcile_in_steady_state_writes_nothing() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    store.insert_raw(deployment()).await.unwrap();
    let r = reconciler(&store);
    let ctx = Context::background();

    r.reconcile_once(&ctx, &req()).await.expect("first");
    let first_time = stored_trait(&store).await.get_condition(TYPE_SYNCED).last_transition_time;
    for _ in 0..3 {
        assert_eq!(r.reconcile_once(&ctx, &req()).await.expect("again"), Outcome::done());
    }
    assert_eq!(target_writes(&store).await, 1);
    assert_eq!(status_writes(&store).await, 1);
    assert_eq!(stored_trait(&store).await.get_condition(TYPE_SYNCED).last_transition_time, first_time);
}

#[tokio::test]
async fn repeated_identical_failure_writes_status_once() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    let r = reconciler(&store);
    let ctx = Context::background();
    for _ in 0..3 {
        assert_eq!(r.reconcile_once(&ctx, &req()).await.expect("absorbed"), Outcome::requeue_after(SHORT));
    }
    assert_eq!(status_writes(&store).await, 1);
}

#[tokio::test]
async fn converges_once_target_appears() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    let r = reconciler(&store);
    let ctx = Context::background();

    assert_eq!(r.reconcile_once(&ctx, &req()).await.unwrap(), Outcome::requeue_after(SHORT));
    assert_eq!(stored_trait(&store).await.get_condition(TYPE_SYNCED).status, ConditionStatus::False);

    store.insert_raw(deployment()).await.unwrap();
    assert_eq!(r.reconcile_once(&ctx, &req()).await.unwrap(), Outcome::done());
    let synced = stored_trait(&store).await.get_condition(TYPE_SYNCED);
    assert_eq!(synced.status, ConditionStatus::True);
    assert_eq!(synced.reason, REASON_RECONCILE_SUCCESS);
    assert_eq!(status_writes(&store).await, 2);
}

#[tokio::test]
async fn status_write_failure_is_propagated() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    store.insert_raw(deployment()).await.unwrap();
    store.inject_fault(Op::UpdateStatus, &trait_kind(), "boom").await;

    let err = reconciler(&store).reconcile_once(&Context::background(), &req()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::UpdateStatus(_)));
    assert_eq!(err.to_string(), "cannot update trait status: boom");
}

/// Rewrites the trait behind the engine's back while the target is being modified.
struct TraitBumper {
    store: Arc<MemStore>,
}

#[async_trait::async_trait]
impl Modifier<Unstructured, Unstructured> for TraitBumper {
    async fn modify(&self, _ctx: &Context, target: &mut Unstructured, tr: &Unstructured) -> anyhow::Result<()> {
        self.store.insert(tr).await?;
        target.set_path(&["spec", "replicas"], serde_json::json!(3));
        Ok(())
    }
}

#[tokio::test]
async fn stale_trait_status_write_conflicts() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    store.insert_raw(deployment()).await.unwrap();

    let r = reconciler(&store).with_modifier(TraitBumper { store: Arc::clone(&store) });
    let err = r.reconcile_once(&Context::background(), &req()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::UpdateStatus(_)));
    assert!(err.access_error().is_conflict(), "err={}", err);
    // the target write itself went through
    assert_eq!(target_writes(&store).await, 1);
}

#[tokio::test]
async fn cancelled_context_fails_trait_fetch() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    let ctx = Context::background();
    ctx.cancel();
    let err = reconciler(&store).reconcile_once(&ctx, &req()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::GetTrait(AccessError::Cancelled)));
}

/// Never finishes on its own.
struct StuckModifier;

#[async_trait::async_trait]
impl Modifier<Unstructured, Unstructured> for StuckModifier {
    async fn modify(&self, _ctx: &Context, _target: &mut Unstructured, _tr: &Unstructured) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn reconcile_timeout_aborts_stuck_modifier() {
    let store = Arc::new(MemStore::new());
    store.insert_raw(patch_trait(true)).await.unwrap();
    store.insert_raw(deployment()).await.unwrap();
    let mut options = trellis_reconciler::ReconcilerOptions::default();
    options.reconcile_timeout = Duration::from_millis(50);
    options.short_wait = SHORT;
    let r = Reconciler::<Unstructured, Unstructured, _, _>::new(Arc::clone(&store), trait_kind(), WorkloadRefResolver::new())
        .with_modifier(StuckModifier)
        .with_options(options);

    let res = tokio::time::timeout(Duration::from_secs(5), r.reconcile_once(&Context::background(), &req()))
        .await
        .expect("engine returned promptly");
    // the deadline also bounds the status write that would record the failure
    let err = res.unwrap_err();
    assert!(matches!(err, ReconcileError::UpdateStatus(AccessError::DeadlineExceeded)), "err={}", err);
    assert_eq!(target_writes(&store).await, 0);
    assert_eq!(stored_trait(&store).await.key(), trait_key());
}
