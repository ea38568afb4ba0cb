//! Cancellable futures: a pending result paired with a composable,
//! best-effort stop hook.
//!
//! Stopping is cooperative. A handler resolves once best-effort signaling
//! has been attempted, whether or not the underlying work honored it.
//! `stop` is idempotent, never fails, and is a no-op on work that already
//! completed.

use crate::error::{EngineError, ExecError, ExecResult};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

type SharedResult<T> = Shared<BoxFuture<'static, ExecResult<T>>>;
type StopFuture = Shared<BoxFuture<'static, ()>>;

enum StopState {
    Idle(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>),
    Stopping(StopFuture),
}

struct StopCell {
    state: Mutex<StopState>,
}

impl StopCell {
    fn stop(&self) -> StopFuture {
        let mut state = self.state.lock().expect("stop cell poisoned");
        match &mut *state {
            StopState::Stopping(fut) => fut.clone(),
            StopState::Idle(_) => {
                let hook = match std::mem::replace(
                    &mut *state,
                    StopState::Stopping(futures::future::ready(()).boxed().shared()),
                ) {
                    StopState::Idle(hook) => hook,
                    StopState::Stopping(_) => unreachable!("guarded by match above"),
                };
                let fut = hook().shared();
                *state = StopState::Stopping(fut.clone());
                fut
            }
        }
    }
}

/// A composable hook that stops in-flight work.
#[derive(Clone)]
pub struct CancellationHandler {
    inner: HandlerInner,
}

#[derive(Clone)]
enum HandlerInner {
    Empty,
    Of(Arc<StopCell>),
    Pair(Box<CancellationHandler>, Box<CancellationHandler>),
    Deferred(Shared<BoxFuture<'static, CancellationHandler>>),
}

impl CancellationHandler {
    /// A handler with nothing to stop.
    pub fn empty() -> Self {
        Self {
            inner: HandlerInner::Empty,
        }
    }

    /// A handler wrapping a stop hook. The hook runs at most once; later
    /// calls share the first invocation's completion.
    pub fn of<F, Fut>(hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: HandlerInner::Of(Arc::new(StopCell {
                state: Mutex::new(StopState::Idle(Box::new(move || hook().boxed()))),
            })),
        }
    }

    /// A handler stopping both halves in parallel.
    pub fn compose(left: CancellationHandler, right: CancellationHandler) -> Self {
        Self {
            inner: HandlerInner::Pair(Box::new(left), Box::new(right)),
        }
    }

    /// A handler that is only known after an asynchronous decision. If the
    /// producing future is dropped without resolving, stopping degrades to
    /// a no-op.
    pub fn from_future<F>(handler: F) -> Self
    where
        F: Future<Output = CancellationHandler> + Send + 'static,
    {
        Self {
            inner: HandlerInner::Deferred(handler.boxed().shared()),
        }
    }

    /// A deferred handler fed by a oneshot channel; a dropped sender
    /// resolves to the empty handler.
    pub(crate) fn from_channel(rx: oneshot::Receiver<CancellationHandler>) -> Self {
        Self::from_future(async move { rx.await.unwrap_or_else(|_| CancellationHandler::empty()) })
    }

    /// Signal everything reachable from this handler to stop, resolving
    /// once best-effort signaling completes.
    pub fn stop(&self) -> BoxFuture<'static, ()> {
        match &self.inner {
            HandlerInner::Empty => futures::future::ready(()).boxed(),
            HandlerInner::Of(cell) => {
                let cell = Arc::clone(cell);
                async move { cell.stop().await }.boxed()
            }
            HandlerInner::Pair(left, right) => {
                let (l, r) = (left.stop(), right.stop());
                async move {
                    futures::future::join(l, r).await;
                }
                .boxed()
            }
            HandlerInner::Deferred(pending) => {
                let pending = pending.clone();
                async move {
                    let handler = pending.await;
                    handler.stop().await;
                }
                .boxed()
            }
        }
    }
}

impl Default for CancellationHandler {
    fn default() -> Self {
        Self::empty()
    }
}

/// A pending result paired with its cancellation handler.
pub struct CFuture<T: Clone> {
    result: SharedResult<T>,
    handler: CancellationHandler,
}

impl<T: Clone> Clone for CFuture<T> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<T> CFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn from_parts(
        result: BoxFuture<'static, ExecResult<T>>,
        handler: CancellationHandler,
    ) -> Self {
        Self {
            result: result.shared(),
            handler,
        }
    }

    pub fn successful(value: T) -> Self {
        Self::uncancellable(futures::future::ready(Ok(value)))
    }

    pub fn failed(error: ExecError) -> Self {
        Self::uncancellable(futures::future::ready(Err(error)))
    }

    /// Pair a future with the empty handler.
    pub fn uncancellable<F>(result: F) -> Self
    where
        F: Future<Output = ExecResult<T>> + Send + 'static,
    {
        Self::from_parts(result.boxed(), CancellationHandler::empty())
    }

    /// Wrap a spawned task; an aborted or panicked task surfaces as a
    /// failure rather than a hang.
    pub fn from_task(task: tokio::task::JoinHandle<ExecResult<T>>) -> Self {
        Self::uncancellable(async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => Err(ExecError::new(anyhow::Error::new(join_err).context(
                    EngineError::EvaluationAborted,
                ))),
            }
        })
    }

    /// The shared result future; awaiting never consumes the value for
    /// other holders.
    pub fn future(&self) -> SharedResult<T> {
        self.result.clone()
    }

    pub async fn await_result(&self) -> ExecResult<T> {
        self.result.clone().await
    }

    /// The completed outcome, if any.
    pub fn peek(&self) -> Option<&ExecResult<T>> {
        self.result.peek()
    }

    pub fn handler(&self) -> &CancellationHandler {
        &self.handler
    }

    /// Lift a fallible transform over the value, preserving the handler.
    pub fn map<U, F>(self, f: F) -> CFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> ExecResult<U> + Send + 'static,
    {
        let result = self.result;
        CFuture::from_parts(async move { f(result.await?) }.boxed(), self.handler)
    }

    /// Wait for both sides, failing as soon as either side fails; the
    /// composed handler stops both.
    pub fn zip<U>(self, other: CFuture<U>) -> CFuture<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let left = self.result;
        let right = other.result;
        CFuture::from_parts(
            async move { futures::future::try_join(left, right).await }.boxed(),
            CancellationHandler::compose(self.handler, other.handler),
        )
    }

    /// Fail-fast join of many futures, composing every handler.
    pub fn zip_all(futures_in: Vec<CFuture<T>>) -> CFuture<Vec<T>> {
        let handler = futures_in
            .iter()
            .map(|f| f.handler.clone())
            .fold(CancellationHandler::empty(), CancellationHandler::compose);
        let results: Vec<_> = futures_in.into_iter().map(|f| f.result).collect();
        CFuture::from_parts(
            async move { futures::future::try_join_all(results).await }.boxed(),
            handler,
        )
    }
}
