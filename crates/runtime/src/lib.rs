//! Trellis runtime: dispatcher driving a reconciler from a stream of trait identities.
//!
//! Guarantees at most one in-flight reconcile per identity. Identities arriving while
//! their reconcile runs are coalesced into a single follow-up run.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use trellis_core::{Context, ObjectKey};
use trellis_reconciler::{Outcome, Reconcile, ReconcileError, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Capacity of the identity channel.
    pub queue_cap: usize,
    /// Reconciles allowed to run at once across all identities.
    pub max_concurrent: usize,
    /// First retry delay after a propagated error; doubles per consecutive failure.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            queue_cap: 1024,
            max_concurrent: 4,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
        }
    }
}

impl DispatchOptions {
    pub fn from_env() -> Self {
        fn env<T: std::str::FromStr>(var: &str) -> Option<T> {
            std::env::var(var).ok().and_then(|s| s.parse().ok())
        }
        let d = Self::default();
        Self {
            queue_cap: env("TRELLIS_QUEUE_CAP").unwrap_or(d.queue_cap).max(1),
            max_concurrent: env("TRELLIS_MAX_CONCURRENT").unwrap_or(d.max_concurrent).max(1),
            backoff_base: env("TRELLIS_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: env("TRELLIS_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
        }
    }

    /// Delay before retry number `failures` (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        self.backoff_base.saturating_mul(1u32 << exp).min(self.backoff_max)
    }
}

pub struct DispatchHandle {
    /// Send identities here. The dispatcher stops once every sender is dropped and work drains.
    pub tx: mpsc::Sender<ObjectKey>,
    pub join: JoinHandle<()>,
}

#[derive(Default)]
struct KeyState {
    running: bool,
    dirty: bool,
    failures: u32,
    /// Pending requeue timer: its deadline and token. Timers with any other token are stale.
    requeue: Option<(Instant, u64)>,
}

type Done = (ObjectKey, Result<Outcome, ReconcileError>);

struct Dispatcher<R: ?Sized> {
    reconciler: Arc<R>,
    opts: DispatchOptions,
    ctx: Context,
    keys: FxHashMap<ObjectKey, KeyState>,
    running: usize,
    permits: Arc<Semaphore>,
    done_tx: mpsc::UnboundedSender<Done>,
    timer_tx: mpsc::UnboundedSender<(ObjectKey, u64)>,
    next_token: u64,
}

/// Spawn a dispatcher. Cancelling `ctx` stops it and cancels in-flight reconciles.
pub fn spawn<R>(reconciler: Arc<R>, opts: DispatchOptions, ctx: Context) -> DispatchHandle
where
    R: Reconcile + ?Sized + 'static,
{
    let (tx, mut rx) = mpsc::channel::<ObjectKey>(opts.queue_cap.max(1));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Done>();
    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel::<(ObjectKey, u64)>();
    let mut d = Dispatcher {
        reconciler,
        opts,
        ctx: ctx.clone(),
        keys: FxHashMap::default(),
        running: 0,
        permits: Arc::new(Semaphore::new(opts.max_concurrent.max(1))),
        done_tx,
        timer_tx,
        next_token: 0,
    };

    let join = tokio::spawn(async move {
        let mut open = true;
        info!(max_concurrent = d.opts.max_concurrent, "dispatcher started");
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("dispatcher cancelled");
                    break;
                }
                maybe = rx.recv(), if open => match maybe {
                    Some(key) => d.enqueue(key),
                    None => {
                        debug!("identity channel closed; draining in-flight reconciles");
                        open = false;
                    }
                },
                Some((key, res)) = done_rx.recv() => d.finish(key, res),
                Some((key, token)) = timer_rx.recv() => d.fire(key, token),
            }
            if !open && d.running == 0 {
                break;
            }
        }
        info!("dispatcher stopped");
    });

    DispatchHandle { tx, join }
}

impl<R: Reconcile + ?Sized + 'static> Dispatcher<R> {
    fn enqueue(&mut self, key: ObjectKey) {
        let st = self.keys.entry(key.clone()).or_default();
        if st.running {
            st.dirty = true;
            counter!("dispatch_coalesced_total", 1u64);
            return;
        }
        self.start(key);
    }

    /// A fresh run supersedes any pending requeue; the run decides the next one.
    fn start(&mut self, key: ObjectKey) {
        let st = self.keys.entry(key.clone()).or_default();
        st.running = true;
        st.dirty = false;
        st.requeue = None;
        self.running += 1;
        counter!("dispatch_runs_total", 1u64);

        let reconciler = Arc::clone(&self.reconciler);
        let permits = Arc::clone(&self.permits);
        let done_tx = self.done_tx.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            let req = Request { key };
            let res = reconciler.reconcile(&ctx, &req).await;
            let _ = done_tx.send((req.key, res));
        });
    }

    fn finish(&mut self, key: ObjectKey, res: Result<Outcome, ReconcileError>) {
        self.running = self.running.saturating_sub(1);
        let Some(st) = self.keys.get_mut(&key) else { return };
        st.running = false;
        let retry = match res {
            Ok(outcome) => {
                st.failures = 0;
                outcome.requeue_after
            }
            Err(e) => {
                st.failures = st.failures.saturating_add(1);
                let delay = self.opts.backoff(st.failures);
                counter!("dispatch_errors_total", 1u64);
                warn!(key = %key, error = %e, failures = st.failures, delay_ms = delay.as_millis() as u64, "reconcile failed; backing off");
                Some(delay)
            }
        };
        if st.dirty {
            self.start(key);
            return;
        }
        match retry {
            Some(after) => self.schedule(key, after),
            None if st.failures == 0 && st.requeue.is_none() => {
                self.keys.remove(&key);
            }
            None => {}
        }
    }

    /// Arm the key's requeue timer unless one at or before the new deadline is already armed.
    fn schedule(&mut self, key: ObjectKey, after: Duration) {
        let at = Instant::now() + after;
        let token = self.next_token;
        let Some(st) = self.keys.get_mut(&key) else { return };
        if matches!(st.requeue, Some((pending, _)) if pending <= at) {
            return;
        }
        self.next_token = self.next_token.wrapping_add(1);
        st.requeue = Some((at, token));

        let timer_tx = self.timer_tx.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(at) => {
                    let _ = timer_tx.send((key, token));
                }
                _ = ctx.cancelled() => {}
            }
        });
    }

    fn fire(&mut self, key: ObjectKey, token: u64) {
        match self.keys.get_mut(&key) {
            Some(st) if matches!(st.requeue, Some((_, t)) if t == token) => {
                st.requeue = None;
                self.enqueue(key);
            }
            _ => {
                counter!("dispatch_stale_timers_total", 1u64);
            }
        }
    }
}
