//! # Conflux
//!
//! The deferred-computation engine of a distributed-batch job framework:
//! a monadic [`Execution`] algebra for composing pipelines (map, flat-map,
//! zip, recover, counters, config transforms, writes) into a DAG that is
//! optimized, de-duplicated against a per-run cache, and driven to
//! completion against an external flow submitter.
//!
//! ## Modules
//!
//! - `execution` - the `Execution<T>` algebra, IR, optimizer and evaluator
//! - `cfuture` - cancellable futures and composable cancellation handlers
//! - `counters` - pointwise-additive counter maps keyed by submission
//! - `writer` - the writer contract and the flow-submission adapter
//! - `config` - immutable run configuration and execution mode
//! - `executor` - the spawn handle and failure-reporting sink
//! - `flow` - opaque planner tokens (pipes, sinks, descriptors, flows)
//! - `semaphore` - bounded-parallelism permits
//! - `error` - shared failures and the distinguished flow-stop signal
//! - `testing` - scriptable collaborators for exercising the engine
//!
//! ## A small pipeline
//!
//! ```no_run
//! use conflux::{Config, Execution, Executor, Mode};
//! use conflux::testing::MockSubmitter;
//!
//! # async fn demo() -> conflux::ExecResult<()> {
//! let pipeline = Execution::from(1)
//!     .map(|n| n + 2)
//!     .flat_map(|n| Execution::from(n * 10));
//!
//! let mode = Mode::local(MockSubmitter::new());
//! let value = pipeline
//!     .run(Config::empty(), mode, &Executor::current())
//!     .await_result()
//!     .await?;
//! assert_eq!(value, 30);
//! # Ok(())
//! # }
//! ```

pub mod cfuture;
pub mod config;
pub mod counters;
pub mod error;
pub mod execution;
pub mod executor;
pub mod flow;
pub mod semaphore;
pub mod testing;
pub mod writer;

pub use cfuture::{CFuture, CancellationHandler};
pub use config::{CachedFile, Config, Mode, UniqueId};
pub use counters::{Counters, CountersById, StatKey, SubmissionId};
pub use error::{EngineError, ExecError, ExecResult, FlowStopError};
pub use execution::Execution;
pub use executor::Executor;
pub use flow::{FlowDef, FlowStats, Pipe, Record, Sink, WriteDescriptor};
pub use writer::{FlowSubmitter, FlowWriter, Writer};
