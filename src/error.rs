//! Error types for the execution engine.
//!
//! Failures travel through shared futures, so the engine's error currency
//! (`ExecError`) is reference-counted and cloneable: every peer of a cached
//! sub-execution observes the same failure. The distinguished
//! [`FlowStopError`] marks cooperative cancellation and is never intercepted
//! by `recover_with`.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Raised when a flow is stopped cooperatively.
///
/// This error bypasses `recover_with` handlers: cancellation must never be
/// converted into a success by user recovery logic.
#[derive(Debug, Error)]
#[error("flow stopped: {reason}")]
pub struct FlowStopError {
    reason: String,
}

impl FlowStopError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Engine-level failures that are not user errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A raw flow definition was submitted against a writer that only
    /// understands write bundles.
    #[error("writer does not support raw flow submission")]
    FlowSubmissionUnsupported,

    /// A `filter` predicate rejected the value.
    #[error("filter failed on: {0}")]
    FilterFailed(String),

    /// An internal downcast failed. This indicates a logic bug in the
    /// engine, not a user error.
    #[error("execution value had unexpected type (expected {expected})")]
    ValueTypeMismatch { expected: &'static str },

    /// The task driving an evaluation was dropped before it completed.
    #[error("evaluation task was dropped before completing")]
    EvaluationAborted,

    /// `with_parallelism` was given a non-positive bound.
    #[error("parallelism must be positive, got {0}")]
    InvalidParallelism(usize),

    /// A pipe handle was requested before its submission completed.
    #[error("pipe {0} has not been materialized by a completed submission")]
    PipeNotMaterialized(String),
}

/// A cloneable failure shared between every consumer of a cached future.
#[derive(Clone)]
pub struct ExecError(Arc<anyhow::Error>);

impl ExecError {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// True when this failure is the distinguished flow-stop signal,
    /// anywhere in its chain.
    pub fn is_flow_stop(&self) -> bool {
        self.0.downcast_ref::<FlowStopError>().is_some()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = self.0.as_ref().as_ref();
        Some(inner)
    }
}

impl From<anyhow::Error> for ExecError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl From<EngineError> for ExecError {
    fn from(error: EngineError) -> Self {
        Self::new(error.into())
    }
}

impl From<FlowStopError> for ExecError {
    fn from(error: FlowStopError) -> Self {
        Self::new(error.into())
    }
}

/// Standard result type for engine operations.
pub type ExecResult<T> = Result<T, ExecError>;
