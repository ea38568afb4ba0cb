//! The deferred-computation algebra.
//!
//! An [`Execution`] describes asynchronous batch work as an immutable DAG.
//! Nothing runs until [`Execution::run`] interprets the graph against a
//! fresh writer and per-run cache; building and composing executions is
//! free of side effects and the same value can be run many times.
//!
//! Structurally equal sub-graphs are evaluated once per run. Equality of
//! function positions is handle identity: cloning an `Execution` (or
//! reusing one in several places) shares work, while building the same
//! pipeline twice from fresh closures does not.

mod cache;
mod eval;
mod ir;
mod optimize;

#[cfg(test)]
mod laws_tests;

use crate::cfuture::CFuture;
use crate::config::{CachedFile, Config, Mode, UniqueId};
use crate::counters::Counters;
use crate::error::{EngineError, ExecError, ExecResult};
use crate::executor::Executor;
use crate::flow::{FlowDef, Pipe, Record, Sink, WriteDescriptor};
use crate::semaphore::{AsyncSemaphore, Permit};
use cache::EvalCache;
use eval::{eval, EvalCtx};
use futures::FutureExt;
use ir::{downcast, Dyn, FlatMapFn, MapFn, Node, PresentFn, RecoverFn, SideFn};
use optimize::{map_node, optimize, zip_node};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How long a failed run waits for in-flight work to stop before the
/// writer is released.
pub(crate) const CANCELLATION_BUDGET: Duration = Duration::from_secs(30);

/// A deferred, composable description of asynchronous batch work.
pub struct Execution<T> {
    node: Arc<Node>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Execution<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Execution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution").finish_non_exhaustive()
    }
}

impl<T> Execution<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn wrap(node: Arc<Node>) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    /// An execution that yields the given value.
    pub fn from(value: T) -> Self {
        Self::from_future(move |_| futures::future::ready(Ok(value.clone())))
    }

    /// Defer a producer to run on the run's executor.
    pub fn from_future<F, Fut>(f: F) -> Self
    where
        F: Fn(&Executor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let erased: ir::FutureFn = Arc::new(move |exec| {
            let fut = f(exec);
            async move {
                fut.await
                    .map(|value| Arc::new(value) as Dyn)
                    .map_err(ExecError::new)
            }
            .boxed()
        });
        Self::wrap(Node::future_const(erased))
    }

    /// Lift an already-computed outcome.
    pub fn from_result(result: anyhow::Result<T>) -> Self {
        let result = result.map_err(ExecError::new);
        let erased: ir::FutureFn = Arc::new(move |_| {
            let result = result.clone().map(|value| Arc::new(value) as Dyn);
            futures::future::ready(result).boxed()
        });
        Self::wrap(Node::future_const(erased))
    }

    /// An execution that fails with the given error.
    pub fn failed(error: impl Into<ExecError>) -> Self {
        let error = error.into();
        let erased: ir::FutureFn =
            Arc::new(move |_| futures::future::ready(Err(error.clone())).boxed());
        Self::wrap(Node::future_const(erased))
    }

    /// Pure transform of the result.
    pub fn map<U, F>(&self, f: F) -> Execution<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let erased: MapFn = Arc::new(move |value| {
            let typed = downcast::<T>(value)?;
            Ok(Arc::new(f(&typed)) as Dyn)
        });
        Execution::wrap(map_node(&self.node, erased))
    }

    /// Sequential dependent continuation.
    pub fn flat_map<U, F>(&self, f: F) -> Execution<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> Execution<U> + Send + Sync + 'static,
    {
        let erased: FlatMapFn = Arc::new(move |value| {
            let typed = downcast::<T>(value)?;
            Ok(f(&typed).node)
        });
        Execution::wrap(Node::flat_mapped(self.node.clone(), erased))
    }

    /// Fail with a domain error when the predicate rejects the value.
    pub fn filter<F>(&self, pred: F) -> Execution<T>
    where
        T: fmt::Debug,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let erased: MapFn = Arc::new(move |value| {
            let typed = downcast::<T>(value.clone())?;
            if pred(&typed) {
                Ok(value)
            } else {
                Err(EngineError::FilterFailed(format!("{typed:?}")).into())
            }
        });
        Execution::wrap(map_node(&self.node, erased))
    }

    /// Parallel composition; fails as soon as either side fails.
    pub fn zip<B>(&self, other: &Execution<B>) -> Execution<(T, B)>
    where
        B: Clone + Send + Sync + 'static,
    {
        let zipped = zip_node(&self.node, &other.node);
        let reshape: MapFn = Arc::new(|value| {
            let pair = downcast::<(Dyn, Dyn)>(value)?;
            let left = downcast::<T>(pair.0.clone())?;
            let right = downcast::<B>(pair.1.clone())?;
            Ok(Arc::new(((*left).clone(), (*right).clone())) as Dyn)
        });
        Execution::wrap(map_node(&zipped, reshape))
    }

    pub fn zip3<A, B>(&self, b: &Execution<A>, c: &Execution<B>) -> Execution<(T, A, B)>
    where
        A: Clone + Send + Sync + 'static,
        B: Clone + Send + Sync + 'static,
    {
        self.zip(b)
            .zip(c)
            .map(|((x, y), z)| (x.clone(), y.clone(), z.clone()))
    }

    pub fn zip4<A, B, C>(
        &self,
        b: &Execution<A>,
        c: &Execution<B>,
        d: &Execution<C>,
    ) -> Execution<(T, A, B, C)>
    where
        A: Clone + Send + Sync + 'static,
        B: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
    {
        self.zip(b)
            .zip(c)
            .zip(d)
            .map(|(((w, x), y), z)| (w.clone(), x.clone(), y.clone(), z.clone()))
    }

    /// Partial recovery. The handler never sees the flow-stop signal, and
    /// returning `None` propagates the failure unchanged.
    pub fn recover_with<F>(&self, handler: F) -> Execution<T>
    where
        F: Fn(&ExecError) -> Option<Execution<T>> + Send + Sync + 'static,
    {
        let erased: RecoverFn = Arc::new(move |err| handler(err).map(|ex| ex.node));
        Execution::wrap(Node::recover_with(self.node.clone(), erased))
    }

    /// Fire-and-forget side effect after completion, success or failure.
    /// A failing hook is reported to the executor's failure sink and never
    /// alters the outcome.
    pub fn on_complete<F>(&self, side: F) -> Execution<T>
    where
        F: Fn(Result<&T, &ExecError>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let erased: SideFn = Arc::new(move |outcome| match outcome {
            Ok(value) => {
                let typed = downcast::<T>(value.clone()).map_err(anyhow::Error::new)?;
                side(Ok(&typed))
            }
            Err(err) => side(Err(err)),
        });
        Execution::wrap(Node::on_complete(self.node.clone(), erased))
    }

    /// Materialize the counters accumulated so far alongside the value.
    /// The counters keep flowing outward for further accumulation.
    pub fn get_counters(&self) -> Execution<(T, Counters)> {
        let node = Node::get_counters(self.node.clone());
        let reshape: MapFn = Arc::new(|value| {
            let pair = downcast::<(Dyn, Counters)>(value)?;
            let typed = downcast::<T>(pair.0.clone())?;
            Ok(Arc::new(((*typed).clone(), pair.1.clone())) as Dyn)
        });
        Execution::wrap(map_node(&node, reshape))
    }

    /// Discard the counters accumulated so far.
    pub fn reset_counters(&self) -> Execution<T> {
        Execution::wrap(Node::reset_counters(self.node.clone()))
    }

    /// Rewrite the effective config for this sub-tree.
    pub fn with_config<F>(&self, f: F) -> Execution<T>
    where
        F: Fn(&Config) -> Config + Send + Sync + 'static,
    {
        Execution::wrap(Node::transformed_config(self.node.clone(), Arc::new(f)))
    }

    /// Evaluate this sub-tree against a fresh memoization scope, bounding
    /// peak cache size on large fan-outs while still sharing the writer.
    pub fn with_new_cache(&self) -> Execution<T> {
        Execution::wrap(Node::with_new_cache(self.node.clone()))
    }

    /// Run the sub-tree under a config carrying a fresh identity token.
    pub fn with_id<F>(f: F) -> Execution<T>
    where
        F: Fn(&UniqueId) -> Execution<T> + Send + Sync + 'static,
    {
        Execution::wrap(Node::unique_id(Arc::new(move |uid| f(uid).node)))
    }

    /// Register a file for distribution and run the sub-tree under the
    /// config that carries it.
    pub fn with_cached_file<F>(path: impl Into<String>, f: F) -> Execution<T>
    where
        F: FnOnce(&CachedFile) -> Execution<T>,
    {
        let file = CachedFile::new(path);
        let inner = f(&file);
        inner.with_config(move |conf| conf.add_cached_file(&file))
    }

    /// Capture the outcome as a value, so failures can be inspected
    /// downstream. The flow-stop signal still propagates as a failure.
    pub fn lift_to_try(&self) -> Execution<Result<T, ExecError>> {
        self.map(|value| Ok::<T, ExecError>(value.clone()))
            .recover_with(|err| Some(Execution::from(Err(err.clone()))))
    }

    /// Zip all executions together; every element is evaluated in
    /// parallel and the values come back in input order.
    pub fn sequence(executions: Vec<Execution<T>>) -> Execution<Vec<T>> {
        let mut acc = Execution::from(Vec::<T>::new());
        for ex in executions {
            acc = acc.zip(&ex).map(|(values, value)| {
                let mut values = values.clone();
                values.push(value.clone());
                values
            });
        }
        acc
    }

    /// Like [`Execution::sequence`] with at most `parallelism` elements
    /// in flight; the permit is released on success and failure alike.
    pub fn with_parallelism(
        executions: Vec<Execution<T>>,
        parallelism: usize,
    ) -> Execution<Vec<T>> {
        if parallelism == 0 {
            return Execution::failed(EngineError::InvalidParallelism(0));
        }
        let semaphore = Arc::new(AsyncSemaphore::new(parallelism));
        let prepared = executions
            .into_iter()
            .map(|ex| {
                let semaphore = semaphore.clone();
                Execution::from_future(move |_| {
                    let semaphore = semaphore.clone();
                    async move { Ok(Arc::new(semaphore.acquire().await)) }
                })
                .flat_map(move |permit: &Arc<Permit>| {
                    let permit = permit.clone();
                    ex.lift_to_try().map(move |outcome| {
                        permit.release();
                        outcome.clone()
                    })
                })
                .flat_map(|outcome: &Result<T, ExecError>| match outcome {
                    Ok(value) => Execution::from(value.clone()),
                    Err(err) => Execution::failed(err.clone()),
                })
            })
            .collect();
        Execution::sequence(prepared)
    }

    /// Interpret the graph to completion against a fresh writer.
    ///
    /// On failure the cancellation chain is stopped with a bounded grace
    /// period before the writer is released; the original failure is what
    /// surfaces.
    pub fn run(&self, conf: Config, mode: Mode, exec: &Executor) -> CFuture<T> {
        let run_id = Uuid::new_v4();
        let conf = conf.with_run_id(run_id);
        let node = if conf.optimization_enabled() {
            optimize(&self.node)
        } else {
            self.node.clone()
        };
        tracing::info!(%run_id, optimization = conf.optimization_enabled(), "starting execution run");

        let writer = mode.new_writer();
        writer.start();
        let cache = Arc::new(EvalCache::new(writer.clone()));
        let ctx = EvalCtx::new(conf, mode, cache, exec.clone());
        let cf = eval(&node, &ctx);

        let root_handler = cf.handler().clone();
        let teardown = root_handler.clone();
        let result = cf.future();
        let outer = async move {
            match result.await {
                Ok((value, _counters)) => {
                    writer.finished();
                    let typed = downcast::<T>(value)?;
                    Ok((*typed).clone())
                }
                Err(err) => {
                    tracing::warn!(%run_id, error = %err, "run failed, stopping in-flight work");
                    if tokio::time::timeout(CANCELLATION_BUDGET, teardown.stop())
                        .await
                        .is_err()
                    {
                        tracing::warn!(%run_id, "cancellation budget elapsed with work still pending");
                    }
                    writer.finished();
                    Err(err)
                }
            }
        }
        .boxed();
        CFuture::from_parts(outer, root_handler)
    }

    /// Blocking variant of [`Execution::run`]. Builds a runtime of its
    /// own, so it must not be called from async context; prefer `run`.
    pub fn wait_for(&self, conf: Config, mode: Mode) -> ExecResult<T> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| ExecError::new(err.into()))?;
        let exec = Executor::new(runtime.handle().clone());
        runtime.block_on(async { self.run(conf, mode, &exec).await_result().await })
    }
}

impl Execution<(Config, Mode)> {
    /// The identity node: yields the effective config and mode.
    pub fn get_config_mode() -> Self {
        Self::wrap(Node::reader())
    }
}

impl Execution<()> {
    pub fn unit() -> Self {
        Execution::from(())
    }

    /// Write a pipe into a sink as part of the run's coalesced submission.
    pub fn write(pipe: Pipe, sink: Sink) -> Self {
        let descriptor = WriteDescriptor::SimpleWrite { pipe, sink };
        let present: PresentFn = Arc::new(|_, _, _, _| {
            futures::future::ready(Ok(Arc::new(()) as Dyn)).boxed()
        });
        Self::wrap(Node::write(vec![descriptor], present))
    }

    /// Submit a raw planner description. Fails on writers that only
    /// understand write bundles.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Config, &Mode) -> anyhow::Result<FlowDef> + Send + Sync + 'static,
    {
        Self::wrap(Node::flow_def(Arc::new(f)))
    }
}

impl Execution<Pipe> {
    /// Materialize a pipe and yield the handle of the materialized copy.
    pub fn force_to_disk(pipe: Pipe) -> Self {
        let descriptor = WriteDescriptor::Force { pipe: pipe.clone() };
        let present: PresentFn = Arc::new(move |conf, _mode, writer, _exec| {
            let pipe = pipe.clone();
            async move {
                let forced = writer.get_forced(&conf, &pipe).await?;
                Ok(Arc::new(forced) as Dyn)
            }
            .boxed()
        });
        Self::wrap(Node::write(vec![descriptor], present))
    }
}

impl Execution<Vec<Record>> {
    /// Materialize a pipe and read its records back.
    pub fn to_iterable(pipe: Pipe) -> Self {
        let descriptor = WriteDescriptor::ToIterable { pipe: pipe.clone() };
        let present: PresentFn = Arc::new(move |conf, _mode, writer, _exec| {
            let pipe = pipe.clone();
            async move {
                let records = writer.get_iterable(&conf, &pipe).await?;
                Ok(Arc::new(records) as Dyn)
            }
            .boxed()
        });
        Self::wrap(Node::write(vec![descriptor], present))
    }
}
