//! The spawn handle and failure-reporting sink threaded through evaluation.
//!
//! Every internal API that schedules work takes an [`Executor`] explicitly.
//! Side-effect failures that must not alter an execution's outcome (the
//! `on_complete` hook) are routed to the installed reporter; the default
//! reporter logs through `tracing`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

type Reporter = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

#[derive(Clone)]
pub struct Executor {
    handle: Handle,
    reporter: Reporter,
}

impl Executor {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            reporter: Arc::new(|error| {
                tracing::error!(%error, "execution side effect failed");
            }),
        }
    }

    /// The executor of the enclosing tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Replace the failure sink for side-effect errors.
    pub fn with_reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub fn report_failure(&self, error: &anyhow::Error) {
        (self.reporter)(error);
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}
