//! The interpreter.
//!
//! Every node is driven by its own spawned task and exposes a shared,
//! cancellable future. A node's task evaluates its children by calling
//! [`eval`] again from inside the task, so the synchronous depth of an
//! evaluation is constant no matter how deep the IR is: a chain of ten
//! thousand `flat_map`s is ten thousand queued tasks, not ten thousand
//! stack frames.
//!
//! Cancellation handlers that depend on asynchronous decisions (the second
//! stage of a `flat_map`, a recovery branch) are published through deferred
//! slots; dropping a slot degrades that hook to a no-op.

use super::cache::{EvalCache, EvalValue, SharedCounters, WritePromise, WriteSlot};
use super::ir::{Dyn, Node, NodeKind, PresentFn};
use super::optimize::optimize;
use crate::cfuture::{CFuture, CancellationHandler};
use crate::config::{Config, Mode};
use crate::counters::{merge_by_id, Counters, CountersById};
use crate::error::{EngineError, ExecError, ExecResult};
use crate::executor::Executor;
use crate::flow::WriteDescriptor;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Everything one evaluation step needs; cheap to clone into tasks.
#[derive(Clone)]
pub(crate) struct EvalCtx {
    pub(crate) conf: Config,
    pub(crate) mode: Mode,
    pub(crate) cache: Arc<EvalCache>,
    pub(crate) exec: Executor,
}

impl EvalCtx {
    pub(crate) fn new(conf: Config, mode: Mode, cache: Arc<EvalCache>, exec: Executor) -> Self {
        Self {
            conf,
            mode,
            cache,
            exec,
        }
    }

    fn with_conf(&self, conf: Config) -> Self {
        Self {
            conf,
            ..self.clone()
        }
    }

    fn with_cache(&self, cache: Arc<EvalCache>) -> Self {
        Self {
            cache,
            ..self.clone()
        }
    }

    fn maybe_optimize(&self, node: &Arc<Node>) -> Arc<Node> {
        if self.conf.optimization_enabled() {
            optimize(node)
        } else {
            node.clone()
        }
    }
}

/// The publishing side of a deferred cancellation handler.
struct HandlerSlot(oneshot::Sender<CancellationHandler>);

impl HandlerSlot {
    fn set(self, handler: CancellationHandler) {
        let _ = self.0.send(handler);
    }
}

fn deferred_handler() -> (HandlerSlot, CancellationHandler) {
    let (tx, rx) = oneshot::channel();
    (HandlerSlot(tx), CancellationHandler::from_channel(rx))
}

/// Drive a node's work on its own task, surfacing panics and aborts as
/// failures.
fn spawn_eval<F>(exec: &Executor, handler: CancellationHandler, work: F) -> CFuture<EvalValue>
where
    F: Future<Output = ExecResult<EvalValue>> + Send + 'static,
{
    let task = exec.spawn(work);
    let result = async move {
        match task.await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(ExecError::new(
                anyhow::Error::new(join_err).context(EngineError::EvaluationAborted),
            )),
        }
    }
    .boxed();
    CFuture::from_parts(result, handler)
}

/// Interpret one node under the given context.
///
/// Every variant memoizes by `(config, node)` except `FutureConst`,
/// `OnComplete` and `Write`: the first two are effectful per occurrence,
/// and writes de-duplicate per descriptor through the write table instead.
pub(crate) fn eval(node: &Arc<Node>, ctx: &EvalCtx) -> CFuture<EvalValue> {
    match &node.kind {
        NodeKind::FutureConst { .. } | NodeKind::OnComplete { .. } | NodeKind::Write { .. } => {
            build(node, ctx)
        }
        _ => {
            let (_is_new, cf) = ctx
                .cache
                .get_or_insert_with(&ctx.conf, node, || build(node, ctx));
            cf
        }
    }
}

fn build(node: &Arc<Node>, ctx: &EvalCtx) -> CFuture<EvalValue> {
    match &node.kind {
        NodeKind::FutureConst { f } => {
            let task = ctx.exec.spawn(f(&ctx.exec));
            CFuture::from_task(task).map(|value| Ok((value, CountersById::new())))
        }

        NodeKind::Reader => CFuture::successful((
            Arc::new((ctx.conf.clone(), ctx.mode.clone())) as Dyn,
            CountersById::new(),
        )),

        NodeKind::Mapped { prev, f } => {
            let (slot, handler) = deferred_handler();
            let (prev, f, ctx2) = (prev.clone(), f.clone(), ctx.clone());
            spawn_eval(&ctx.exec, handler, async move {
                let inner = eval(&prev, &ctx2);
                slot.set(inner.handler().clone());
                let (value, counters) = inner.await_result().await?;
                Ok((f(value)?, counters))
            })
        }

        NodeKind::FlatMapped { prev, f } => {
            let (slot, handler) = deferred_handler();
            let (prev, f, ctx2) = (prev.clone(), f.clone(), ctx.clone());
            spawn_eval(&ctx.exec, handler, async move {
                let first = eval(&prev, &ctx2);
                let (second_slot, second_handler) = deferred_handler();
                slot.set(CancellationHandler::compose(
                    first.handler().clone(),
                    second_handler,
                ));
                let (value, first_counters) = first.await_result().await?;
                let next = ctx2.maybe_optimize(&f(value)?);
                let second = eval(&next, &ctx2);
                second_slot.set(second.handler().clone());
                let (value, second_counters) = second.await_result().await?;
                Ok((value, merge_by_id(first_counters, second_counters)))
            })
        }

        NodeKind::Zipped { left, right } => {
            let (slot, handler) = deferred_handler();
            let (left, right, ctx2) = (left.clone(), right.clone(), ctx.clone());
            spawn_eval(&ctx.exec, handler, async move {
                let lf = eval(&left, &ctx2);
                let rf = eval(&right, &ctx2);
                slot.set(CancellationHandler::compose(
                    lf.handler().clone(),
                    rf.handler().clone(),
                ));
                let ((lv, lc), (rv, rc)) =
                    futures::future::try_join(lf.future(), rf.future()).await?;
                Ok((Arc::new((lv, rv)) as Dyn, merge_by_id(lc, rc)))
            })
        }

        NodeKind::OnComplete { prev, side } => {
            let (slot, handler) = deferred_handler();
            let (prev, side, ctx2) = (prev.clone(), side.clone(), ctx.clone());
            spawn_eval(&ctx.exec, handler, async move {
                let inner = eval(&prev, &ctx2);
                slot.set(inner.handler().clone());
                let outcome = inner.await_result().await;
                let side_view = outcome
                    .as_ref()
                    .map(|(value, _)| value.clone())
                    .map_err(|e| e.clone());
                if let Err(err) = side(&side_view) {
                    ctx2.exec.report_failure(&err);
                }
                outcome
            })
        }

        NodeKind::RecoverWith { prev, handler: recover } => {
            let (slot, handler) = deferred_handler();
            let (prev, recover, ctx2) = (prev.clone(), recover.clone(), ctx.clone());
            spawn_eval(&ctx.exec, handler, async move {
                let first = eval(&prev, &ctx2);
                let (second_slot, second_handler) = deferred_handler();
                slot.set(CancellationHandler::compose(
                    first.handler().clone(),
                    second_handler,
                ));
                match first.await_result().await {
                    Ok(value) => Ok(value),
                    // The flow-stop signal is re-raised unchanged.
                    Err(err) if err.is_flow_stop() => Err(err),
                    Err(err) => match recover(&err) {
                        Some(next) => {
                            let next = ctx2.maybe_optimize(&next);
                            let second = eval(&next, &ctx2);
                            second_slot.set(second.handler().clone());
                            second.await_result().await
                        }
                        None => Err(err),
                    },
                }
            })
        }

        NodeKind::GetCounters { prev } => {
            let (slot, handler) = deferred_handler();
            let (prev, ctx2) = (prev.clone(), ctx.clone());
            spawn_eval(&ctx.exec, handler, async move {
                let inner = eval(&prev, &ctx2);
                slot.set(inner.handler().clone());
                let (value, counters) = inner.await_result().await?;
                let flattened = Counters::flatten_by_id(&counters);
                // Counters keep flowing outward for further accumulation.
                Ok((Arc::new((value, flattened)) as Dyn, counters))
            })
        }

        NodeKind::ResetCounters { prev } => {
            let (slot, handler) = deferred_handler();
            let (prev, ctx2) = (prev.clone(), ctx.clone());
            spawn_eval(&ctx.exec, handler, async move {
                let inner = eval(&prev, &ctx2);
                slot.set(inner.handler().clone());
                let (value, _discarded) = inner.await_result().await?;
                Ok((value, CountersById::new()))
            })
        }

        NodeKind::TransformedConfig { prev, f } => {
            let (slot, handler) = deferred_handler();
            let (prev, f, ctx2) = (prev.clone(), f.clone(), ctx.clone());
            spawn_eval(&ctx.exec, handler, async move {
                // The sub-tree caches under the transformed config, so the
                // same tree under different configs is never conflated.
                let inner_ctx = ctx2.with_conf(f(&ctx2.conf));
                let inner = eval(&prev, &inner_ctx);
                slot.set(inner.handler().clone());
                inner.await_result().await
            })
        }

        NodeKind::WithNewCache { prev } => {
            let (slot, handler) = deferred_handler();
            let (prev, ctx2) = (prev.clone(), ctx.clone());
            spawn_eval(&ctx.exec, handler, async move {
                let inner_ctx = ctx2.with_cache(ctx2.cache.clean_cache());
                let inner = eval(&prev, &inner_ctx);
                slot.set(inner.handler().clone());
                inner.await_result().await
            })
        }

        NodeKind::UniqueIdFn { f } => {
            let (slot, handler) = deferred_handler();
            let (f, ctx2) = (f.clone(), ctx.clone());
            spawn_eval(&ctx.exec, handler, async move {
                let (uid, conf) = ctx2.conf.ensure_unique_id();
                let next = f(&uid);
                let inner_ctx = ctx2.with_conf(conf);
                let inner = eval(&next, &inner_ctx);
                slot.set(inner.handler().clone());
                inner.await_result().await
            })
        }

        NodeKind::FlowDefFn { f } => {
            let (slot, handler) = deferred_handler();
            let (f, ctx2) = (f.clone(), ctx.clone());
            spawn_eval(&ctx.exec, handler, async move {
                let flow = f(&ctx2.conf, &ctx2.mode).map_err(ExecError::new)?;
                let submission = ctx2.cache.writer().submit_flow(&ctx2.conf, flow)?;
                slot.set(submission.handler().clone());
                let (id, counters) = submission.await_result().await?;
                Ok((
                    Arc::new(()) as Dyn,
                    HashMap::from([(id, counters)]),
                ))
            })
        }

        NodeKind::Write {
            descriptors,
            present,
        } => eval_write(descriptors.clone(), present.clone(), ctx),
    }
}

/// The write coalescer.
///
/// Each descriptor is locked in the write table; the owned subset is
/// submitted as one bundle and its outcome broadcast to every peer that
/// registered the same descriptor. The result function runs only after
/// the bundled submission and every peer submission resolved.
fn eval_write(
    descriptors: Vec<WriteDescriptor>,
    present: PresentFn,
    ctx: &EvalCtx,
) -> CFuture<EvalValue> {
    let (slot, handler) = deferred_handler();
    let ctx2 = ctx.clone();
    spawn_eval(&ctx.exec, handler, async move {
        let mut owned_promises: Vec<WritePromise> = Vec::new();
        let mut owned_descriptors: Vec<WriteDescriptor> = Vec::new();
        let mut peers: Vec<SharedCounters> = Vec::new();
        for descriptor in &descriptors {
            match ctx2.cache.get_or_lock(&ctx2.conf, descriptor) {
                WriteSlot::Owned(promise) => {
                    owned_promises.push(promise);
                    owned_descriptors.push(descriptor.clone());
                }
                WriteSlot::Shared(shared) => peers.push(shared),
            }
        }

        // A peer that already failed fails this node without submitting
        // anything, but the slots we locked must still resolve or their
        // own peers would hang.
        let already_failed = peers.iter().find_map(|peer| match peer.peek() {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        });
        if let Some(err) = already_failed {
            for promise in owned_promises {
                promise.fulfill(Err(err.clone()));
            }
            slot.set(CancellationHandler::empty());
            return Err(err);
        }

        let ours: Option<SharedCounters> = if owned_descriptors.is_empty() {
            slot.set(CancellationHandler::empty());
            None
        } else {
            tracing::debug!(
                owned = owned_descriptors.len(),
                shared = peers.len(),
                "submitting coalesced write bundle"
            );
            let submission = ctx2
                .cache
                .writer()
                .execute(&ctx2.conf, owned_descriptors);
            slot.set(submission.handler().clone());
            let by_id: SharedCounters = {
                let outcome = submission.future();
                async move {
                    let (id, counters) = outcome.await?;
                    Ok(HashMap::from([(id, counters)]))
                }
                .boxed()
                .shared()
            };
            // Peers of our descriptors observe the very same outcome.
            let broadcast = by_id.clone();
            ctx2.exec.spawn(async move {
                let outcome = broadcast.await;
                for promise in owned_promises {
                    promise.fulfill(outcome.clone());
                }
            });
            Some(by_id)
        };

        let peer_counters = futures::future::try_join_all(peers);
        let merged = match ours {
            Some(by_id) => {
                let (our_map, peer_maps) =
                    futures::future::try_join(by_id, peer_counters).await?;
                peer_maps.into_iter().fold(our_map, merge_by_id)
            }
            None => peer_counters
                .await?
                .into_iter()
                .fold(CountersById::new(), merge_by_id),
        };

        let value = present(
            ctx2.conf.clone(),
            ctx2.mode.clone(),
            ctx2.cache.writer().clone(),
            ctx2.exec.clone(),
        )
        .await?;
        Ok((value, merged))
    })
}
