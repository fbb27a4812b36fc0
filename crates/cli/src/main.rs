use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};
use trellis_core::condition::TYPE_SYNCED;
use trellis_core::{Accessor, Condition, Conditioned, Context, Kind, ObjectKey, Unstructured};
use trellis_kubehub::KubeAccessor;
use trellis_reconciler::{
    MergePatchModifier, Modifier, NopModifier, Outcome, Reconciler, ReconcilerOptions, Request, UnstructuredReconciler,
    WorkloadRefResolver,
};
use trellis_runtime::DispatchOptions;
use trellis_store::MemStore;

#[derive(Parser, Debug)]
#[command(name = "trellisctl", version, about = "Trellis trait reconciler CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the trait (default: "default")
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

/// How the target is modified on behalf of the trait.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ModifierKind {
    /// Leave the target untouched; only the Synced condition is maintained
    Nop,
    /// Apply the trait's spec.patch to the target as a JSON merge patch
    MergePatch,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single reconcile against the cluster and print the outcome
    Once {
        /// Trait GVK key, e.g. "example.dev/v1alpha1/ScalerTrait"
        gvk: String,
        /// Trait name
        name: String,
        #[arg(long = "modifier", value_enum, default_value_t = ModifierKind::MergePatch)]
        modifier: ModifierKind,
    },
    /// Watch a trait kind and reconcile every trait until Ctrl-C
    Run {
        /// Trait GVK key, e.g. "example.dev/v1alpha1/ScalerTrait"
        gvk: String,
        #[arg(long = "modifier", value_enum, default_value_t = ModifierKind::MergePatch)]
        modifier: ModifierKind,
    },
    /// Print a trait's conditions
    Conditions {
        gvk: String,
        name: String,
    },
    /// Reconcile a trait from a multi-document YAML fixture, without a cluster
    Demo {
        /// YAML file holding the trait, its target and anything else to preload
        file: std::path::PathBuf,
        gvk: String,
        name: String,
        #[arg(long = "modifier", value_enum, default_value_t = ModifierKind::MergePatch)]
        modifier: ModifierKind,
    },
}

fn init_tracing() {
    let env = std::env::var("TRELLIS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TRELLIS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TRELLIS_METRICS_ADDR; expected host:port");
        }
    }
}

fn build<A, M>(accessor: A, kind: Kind, modifier: M) -> UnstructuredReconciler<A, WorkloadRefResolver, M> {
    Reconciler::new(accessor, kind, WorkloadRefResolver::new())
        .with_modifier(modifier)
        .with_options(ReconcilerOptions::from_env())
}

#[derive(Debug, Serialize)]
struct Report {
    #[serde(rename = "trait")]
    trait_ref: String,
    requeue_after_secs: Option<u64>,
    synced: Condition,
}

fn print_report(output: Output, report: &Report) -> Result<()> {
    match output {
        Output::Human => {
            let next = match report.requeue_after_secs {
                Some(s) => format!("requeue in {}s", s),
                None => "done".to_string(),
            };
            println!("{} • {}", report.trait_ref, next);
            print_conditions(Output::Human, std::slice::from_ref(&report.synced))?;
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn print_conditions(output: Output, conditions: &[Condition]) -> Result<()> {
    match output {
        Output::Human => {
            println!("TYPE       STATUS   REASON              MESSAGE");
            for c in conditions {
                println!("{:<10} {:<8} {:<19} {}", c.ty, format!("{:?}", c.status), c.reason, c.message.as_deref().unwrap_or(""));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(conditions)?),
    }
    Ok(())
}

/// Run one reconcile and report the trait's resulting Synced condition.
async fn once_with<A, M>(ctx: &Context, accessor: A, kind: Kind, key: ObjectKey, modifier: M) -> Result<Report>
where
    A: Accessor<Unstructured> + Clone,
    M: Modifier<Unstructured, Unstructured>,
{
    let r = build(accessor.clone(), kind.clone(), modifier);
    let outcome: Outcome = r.reconcile_once(ctx, &Request::from(key.clone())).await?;
    let synced = match accessor.get(ctx, &kind, &key).await {
        Ok(tr) => tr.get_condition(TYPE_SYNCED),
        Err(e) if e.is_not_found() => Condition::unknown(TYPE_SYNCED),
        Err(e) => return Err(e.into()),
    };
    Ok(Report {
        trait_ref: format!("{} {}", kind, key),
        requeue_after_secs: outcome.requeue_after.map(|d| d.as_secs()),
        synced,
    })
}

async fn once<A>(ctx: &Context, accessor: A, kind: Kind, key: ObjectKey, modifier: ModifierKind) -> Result<Report>
where
    A: Accessor<Unstructured> + Clone,
{
    match modifier {
        ModifierKind::Nop => once_with(ctx, accessor, kind, key, NopModifier).await,
        ModifierKind::MergePatch => once_with(ctx, accessor, kind, key, MergePatchModifier::new()).await,
    }
}

/// Parse every non-empty YAML document in `text` into a JSON value.
fn load_documents(text: &str) -> Result<Vec<serde_json::Value>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let v = serde_json::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", i + 1))?;
        if !v.is_null() {
            out.push(v);
        }
    }
    Ok(out)
}

async fn demo_store(file: &std::path::Path) -> Result<Arc<MemStore>> {
    let text = tokio::fs::read_to_string(file).await.with_context(|| format!("reading {}", file.display()))?;
    let store = Arc::new(MemStore::new());
    for doc in load_documents(&text)? {
        store.insert_raw(doc).await?;
    }
    Ok(store)
}

async fn run_loop<M>(ctx: Context, accessor: KubeAccessor, kind: Kind, namespace: Option<String>, modifier: M) -> Result<()>
where
    M: Modifier<Unstructured, Unstructured> + 'static,
{
    let reconciler = Arc::new(build(accessor.clone(), kind.clone(), modifier));
    let handle = trellis_runtime::spawn(reconciler, DispatchOptions::from_env(), ctx.clone());
    let watcher = tokio::spawn({
        let ctx = ctx.clone();
        let tx = handle.tx;
        async move {
            if let Err(e) = trellis_kubehub::watch_keys(&accessor, &ctx, &kind, namespace.as_deref(), tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("interrupt received; shutting down");
            ctx.cancel();
        }
        _ = ctx.cancelled() => {}
    }
    let _ = watcher.await;
    let _ = tokio::time::timeout(Duration::from_secs(5), handle.join).await;
    Ok(())
}

fn trait_key(namespace: &Option<String>, name: String) -> ObjectKey {
    ObjectKey::namespaced(namespace.clone().unwrap_or_else(|| "default".to_string()), name)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ctx = Context::background();

    match cli.command {
        Commands::Once { gvk, name, modifier } => {
            let kind = Kind::parse(&gvk)?;
            let key = trait_key(&cli.namespace, name);
            info!(kind = %kind, key = %key, ?modifier, "once invoked");
            let accessor = KubeAccessor::try_default().await?;
            let report = once(&ctx, accessor, kind, key, modifier).await?;
            print_report(cli.output, &report)?;
        }
        Commands::Run { gvk, modifier } => {
            let kind = Kind::parse(&gvk)?;
            info!(kind = %kind, ns = ?cli.namespace, ?modifier, "run invoked");
            let accessor = KubeAccessor::try_default().await?;
            match modifier {
                ModifierKind::Nop => run_loop(ctx, accessor, kind, cli.namespace, NopModifier).await?,
                ModifierKind::MergePatch => run_loop(ctx, accessor, kind, cli.namespace, MergePatchModifier::new()).await?,
            }
        }
        Commands::Conditions { gvk, name } => {
            let kind = Kind::parse(&gvk)?;
            let key = trait_key(&cli.namespace, name);
            let accessor = KubeAccessor::try_default().await?;
            let tr: Unstructured = accessor.get(&ctx, &kind, &key).await?;
            let conditions: Vec<Condition> = tr.conditioned_status().conditions.into_iter().collect();
            print_conditions(cli.output, &conditions)?;
        }
        Commands::Demo { file, gvk, name, modifier } => {
            let kind = Kind::parse(&gvk)?;
            let key = trait_key(&cli.namespace, name);
            info!(file = %file.display(), kind = %kind, key = %key, "demo invoked");
            let store = demo_store(&file).await?;
            let report = once(&ctx, Arc::clone(&store), kind.clone(), key.clone(), modifier).await?;
            print_report(cli.output, &report)?;
            if let Some(target) = store_target(&store, &kind, &key).await {
                match cli.output {
                    Output::Human => println!("{}", serde_yaml::to_string(&target)?),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&target)?),
                }
            }
        }
    }
    Ok(())
}

/// The demo's resolved target as stored after the reconcile, if it resolves.
async fn store_target(store: &MemStore, kind: &Kind, key: &ObjectKey) -> Option<serde_json::Value> {
    use trellis_reconciler::Resolver;
    let tr = Unstructured::from_value(store.raw(kind, key).await?).ok()?;
    let target = WorkloadRefResolver::new().resolve(&tr)?;
    store.raw(&target.kind, &target.key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::ConditionStatus;

    const FIXTURE: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: demo
spec:
  replicas: 1
---
apiVersion: example.dev/v1alpha1
kind: PatchTrait
metadata:
  name: scale-web
  namespace: demo
spec:
  workloadRef:
    apiVersion: apps/v1
    kind: Deployment
    name: web
  patch:
    spec:
      replicas: 3
"#;

    #[test]
    fn loads_multi_document_yaml() {
        let docs = load_documents(FIXTURE).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["spec"]["patch"]["spec"]["replicas"], serde_json::json!(3));
    }

    #[tokio::test]
    async fn demo_fixture_patches_target_and_syncs() {
        let store = Arc::new(MemStore::new());
        for doc in load_documents(FIXTURE).unwrap() {
            store.insert_raw(doc).await.unwrap();
        }
        let kind = Kind::new("example.dev", "v1alpha1", "PatchTrait");
        let key = ObjectKey::namespaced("demo", "scale-web");
        let report = once(&Context::background(), Arc::clone(&store), kind.clone(), key.clone(), ModifierKind::MergePatch)
            .await
            .unwrap();
        assert_eq!(report.requeue_after_secs, None);
        assert_eq!(report.synced.status, ConditionStatus::True);

        let target = store_target(&store, &kind, &key).await.expect("target");
        assert_eq!(target["spec"]["replicas"], serde_json::json!(3));
    }
}
