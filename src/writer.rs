//! The writer contract and the flow-submission adapter.
//!
//! A [`Writer`] is the engine's only door to the external planner: it plans
//! and runs bundles of write descriptors and hands back materialized pipes.
//! [`FlowWriter`] adapts that contract onto a [`FlowSubmitter`], the
//! external collaborator that actually talks to the cluster.

use crate::cfuture::{CFuture, CancellationHandler};
use crate::config::Config;
use crate::counters::{Counters, SubmissionId};
use crate::error::{EngineError, ExecError, ExecResult, FlowStopError};
use crate::flow::{FlowDef, Pipe, Record, WriteDescriptor};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// The planner-facing collaborator of one run.
///
/// `start` is called once before any `execute`; `finished` once after the
/// last, on success and on failure alike. `get_forced` and `get_iterable`
/// are only valid after the submission that materialized the pipe has
/// completed.
#[async_trait]
pub trait Writer: Send + Sync {
    fn start(&self);

    /// Must be idempotent and must never panic; runs on every exit path.
    fn finished(&self);

    /// Atomically plan and run one bundle. An empty bundle is legal and
    /// yields a fresh submission id with empty counters.
    fn execute(&self, conf: &Config, writes: Vec<WriteDescriptor>)
        -> CFuture<(SubmissionId, Counters)>;

    async fn get_forced(&self, conf: &Config, pipe: &Pipe) -> ExecResult<Pipe>;

    async fn get_iterable(&self, conf: &Config, pipe: &Pipe) -> ExecResult<Vec<Record>>;

    /// Raw flow-def submission; only honored by writers that understand
    /// whole planner descriptions.
    fn submit_flow(
        &self,
        _conf: &Config,
        _flow: FlowDef,
    ) -> ExecResult<CFuture<(SubmissionId, Counters)>> {
        Err(EngineError::FlowSubmissionUnsupported.into())
    }
}

/// The external cluster/planner contract.
#[async_trait]
pub trait FlowSubmitter: Send + Sync {
    /// Plan and run one flow to completion, reporting raw stats.
    async fn submit(&self, conf: &Config, flow: &FlowDef) -> anyhow::Result<crate::flow::FlowStats>;

    /// Best-effort abort of an in-flight flow.
    async fn abort(&self, _flow_name: &str) {}
}

struct FlowWriterInner {
    submitter: Arc<dyn FlowSubmitter>,
    next_submission: AtomicU64,
    started: AtomicBool,
    finished: AtomicBool,
    /// pipe name -> handle of the materialized pipe.
    forced: Mutex<HashMap<String, Pipe>>,
    /// pipe name -> records read back from the materialized pipe.
    iterables: Mutex<HashMap<String, Vec<Record>>>,
}

/// Adapter from the [`Writer`] contract onto an external [`FlowSubmitter`].
///
/// One instance lives for exactly one `run`: submission ids are fresh per
/// writer, and materialized handles are only meaningful within the run.
pub struct FlowWriter {
    inner: Arc<FlowWriterInner>,
}

impl FlowWriter {
    pub fn new(submitter: Arc<dyn FlowSubmitter>) -> Self {
        Self {
            inner: Arc::new(FlowWriterInner {
                submitter,
                next_submission: AtomicU64::new(0),
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                forced: Mutex::new(HashMap::new()),
                iterables: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn submit_bundle(&self, conf: &Config, flow: FlowDef) -> CFuture<(SubmissionId, Counters)> {
        let inner = self.inner.clone();
        let id = SubmissionId(inner.next_submission.fetch_add(1, Ordering::SeqCst) + 1);
        let conf = conf.clone();
        let done = Arc::new(AtomicBool::new(false));

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let handler = {
            let inner = inner.clone();
            let done = done.clone();
            let flow_name = flow.name().to_string();
            CancellationHandler::of(move || async move {
                if !done.load(Ordering::SeqCst) {
                    debug!(flow = %flow_name, "aborting in-flight submission");
                    inner.submitter.abort(&flow_name).await;
                    let _ = cancel_tx.send(());
                }
            })
        };

        let result = async move {
            let started_at = Utc::now();
            debug!(flow = %flow.name(), writes = flow.writes().len(), %id, "submitting flow bundle");
            let outcome = tokio::select! {
                res = inner.submitter.submit(&conf, &flow) => res,
                _ = cancel_rx => Err(anyhow::Error::new(FlowStopError::new(format!(
                    "flow {} stopped",
                    flow.name()
                )))),
            };
            done.store(true, Ordering::SeqCst);
            let stats = outcome.map_err(ExecError::new)?;

            {
                let mut iterables = inner.iterables.lock().expect("iterables lock poisoned");
                for (pipe, records) in &stats.materialized {
                    iterables.insert(pipe.clone(), records.clone());
                }
            }
            {
                let mut forced = inner.forced.lock().expect("forced lock poisoned");
                for write in flow.writes() {
                    // Only a Force yields a re-readable handle. ToIterable
                    // pipes surface through get_iterable and sink writes
                    // expose nothing.
                    if let WriteDescriptor::Force { pipe } = write {
                        let name = pipe.name().to_string();
                        forced
                            .entry(name.clone())
                            .or_insert_with(|| Pipe::named(format!("{name}#materialized")));
                    }
                }
            }

            let counters = Counters::from_raw(&stats.raw_counters);
            info!(
                flow = %stats.flow_name,
                %id,
                elapsed_ms = (Utc::now() - started_at).num_milliseconds(),
                counter_keys = counters.len(),
                "flow bundle completed"
            );
            Ok((id, counters))
        }
        .boxed();

        CFuture::from_parts(result, handler)
    }
}

#[async_trait]
impl Writer for FlowWriter {
    fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("writer started more than once");
        } else {
            debug!("writer started");
        }
    }

    fn finished(&self) {
        if !self.inner.finished.swap(true, Ordering::SeqCst) {
            debug!("writer finished");
        }
    }

    fn execute(
        &self,
        conf: &Config,
        writes: Vec<WriteDescriptor>,
    ) -> CFuture<(SubmissionId, Counters)> {
        if writes.is_empty() {
            let id = SubmissionId(self.inner.next_submission.fetch_add(1, Ordering::SeqCst) + 1);
            return CFuture::successful((id, Counters::empty()));
        }
        let id_hint = self.inner.next_submission.load(Ordering::SeqCst) + 1;
        let flow = FlowDef::with_writes(format!("conflux-bundle-{id_hint}"), writes);
        self.submit_bundle(conf, flow)
    }

    async fn get_forced(&self, _conf: &Config, pipe: &Pipe) -> ExecResult<Pipe> {
        self.inner
            .forced
            .lock()
            .expect("forced lock poisoned")
            .get(pipe.name())
            .cloned()
            .ok_or_else(|| EngineError::PipeNotMaterialized(pipe.name().to_string()).into())
    }

    async fn get_iterable(&self, _conf: &Config, pipe: &Pipe) -> ExecResult<Vec<Record>> {
        self.inner
            .iterables
            .lock()
            .expect("iterables lock poisoned")
            .get(pipe.name())
            .cloned()
            .ok_or_else(|| EngineError::PipeNotMaterialized(pipe.name().to_string()).into())
    }

    fn submit_flow(
        &self,
        conf: &Config,
        flow: FlowDef,
    ) -> ExecResult<CFuture<(SubmissionId, Counters)>> {
        Ok(self.submit_bundle(conf, flow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Sink;
    use crate::testing::MockSubmitter;

    fn force(name: &str) -> WriteDescriptor {
        WriteDescriptor::Force {
            pipe: Pipe::named(name),
        }
    }

    #[tokio::test]
    async fn execute_submits_one_flow_with_the_whole_bundle() {
        let submitter = MockSubmitter::new();
        let writer = FlowWriter::new(submitter.clone());
        let writes = vec![
            force("a"),
            WriteDescriptor::SimpleWrite {
                pipe: Pipe::named("b"),
                sink: Sink::named("out"),
            },
        ];
        let (id, _) = writer
            .execute(&Config::empty(), writes)
            .await_result()
            .await
            .unwrap();
        assert_eq!(id, SubmissionId(1));
        let flows = submitter.submissions();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].writes().len(), 2);
    }

    #[tokio::test]
    async fn empty_bundle_yields_fresh_id_without_submitting() {
        let submitter = MockSubmitter::new();
        let writer = FlowWriter::new(submitter.clone());
        let (id, counters) = writer
            .execute(&Config::empty(), Vec::new())
            .await_result()
            .await
            .unwrap();
        assert_eq!(id, SubmissionId(1));
        assert!(counters.is_empty());
        assert_eq!(submitter.submissions().len(), 0);
    }

    #[tokio::test]
    async fn submission_ids_are_monotonically_fresh() {
        let submitter = MockSubmitter::new();
        let writer = FlowWriter::new(submitter.clone());
        let (first, _) = writer
            .execute(&Config::empty(), vec![force("a")])
            .await_result()
            .await
            .unwrap();
        let (second, _) = writer
            .execute(&Config::empty(), vec![force("b")])
            .await_result()
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn counters_are_adapted_from_raw_stats() {
        let submitter = MockSubmitter::new().with_counter("io", "tuples", 99);
        let writer = FlowWriter::new(submitter);
        let (_, counters) = writer
            .execute(&Config::empty(), vec![force("a")])
            .await_result()
            .await
            .unwrap();
        assert_eq!(counters.value(&crate::counters::StatKey::new("io", "tuples")), 99);
    }

    #[tokio::test]
    async fn forced_pipes_are_retrievable_after_execute() {
        let submitter = MockSubmitter::new();
        let writer = FlowWriter::new(submitter);
        let pipe = Pipe::named("events");
        writer
            .execute(&Config::empty(), vec![force("events")])
            .await_result()
            .await
            .unwrap();
        let handle = writer.get_forced(&Config::empty(), &pipe).await.unwrap();
        assert_ne!(handle, pipe);
    }

    #[tokio::test]
    async fn sink_writes_do_not_materialize_forced_handles() {
        let submitter = MockSubmitter::new();
        let writer = FlowWriter::new(submitter);
        let writes = vec![WriteDescriptor::SimpleWrite {
            pipe: Pipe::named("events"),
            sink: Sink::named("hdfs://out"),
        }];
        writer
            .execute(&Config::empty(), writes)
            .await_result()
            .await
            .unwrap();
        let err = writer
            .get_forced(&Config::empty(), &Pipe::named("events"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::PipeNotMaterialized(_))
        ));
    }

    #[tokio::test]
    async fn get_forced_before_execute_fails() {
        let submitter = MockSubmitter::new();
        let writer = FlowWriter::new(submitter);
        let err = writer
            .get_forced(&Config::empty(), &Pipe::named("events"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::PipeNotMaterialized(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_aborts_and_raises_flow_stop() {
        let submitter = MockSubmitter::new().with_submit_delay(std::time::Duration::from_secs(30));
        let writer = FlowWriter::new(submitter.clone());
        let cf = writer.execute(&Config::empty(), vec![force("slow")]);
        let pending = cf.future();
        cf.handler().stop().await;
        let err = pending.await.unwrap_err();
        assert!(err.is_flow_stop());
        assert_eq!(submitter.aborted().len(), 1);
    }

    #[tokio::test]
    async fn default_writers_reject_raw_flow_submission() {
        struct BundlesOnly;
        #[async_trait]
        impl Writer for BundlesOnly {
            fn start(&self) {}
            fn finished(&self) {}
            fn execute(
                &self,
                _conf: &Config,
                _writes: Vec<WriteDescriptor>,
            ) -> CFuture<(SubmissionId, Counters)> {
                CFuture::successful((SubmissionId(1), Counters::empty()))
            }
            async fn get_forced(&self, _conf: &Config, pipe: &Pipe) -> ExecResult<Pipe> {
                Ok(pipe.clone())
            }
            async fn get_iterable(&self, _conf: &Config, _pipe: &Pipe) -> ExecResult<Vec<Record>> {
                Ok(Vec::new())
            }
        }

        let err = BundlesOnly
            .submit_flow(&Config::empty(), FlowDef::named("raw"))
            .err()
            .expect("raw submission must be rejected");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::FlowSubmissionUnsupported)
        ));
    }
}
