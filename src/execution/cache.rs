//! The per-run memoization cache.
//!
//! Two tables, both keyed by config plus identity: the execution table
//! maps `(config, node)` to the in-flight or completed future of that
//! sub-execution; the write table maps `(config, descriptor)` to the
//! counters future of the submission that owns the descriptor. Insertion
//! is atomic check-and-insert under a short lock; builders only construct
//! futures and never await, so no lock is held across a suspension.

use super::ir::{Dyn, Node, NodeKey};
use crate::cfuture::CFuture;
use crate::config::Config;
use crate::counters::CountersById;
use crate::error::{EngineError, ExecError, ExecResult};
use crate::flow::WriteDescriptor;
use crate::writer::Writer;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// What the evaluator produces for every node: the type-erased value plus
/// counters keyed by submission.
pub(crate) type EvalValue = (Dyn, CountersById);

pub(crate) type SharedCounters = Shared<BoxFuture<'static, ExecResult<CountersById>>>;

#[derive(Clone, PartialEq, Eq, Hash)]
struct ExecKey {
    conf: Config,
    node: NodeKey,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct WriteKey {
    conf: Config,
    descriptor: WriteDescriptor,
}

/// The completion side of a locked write slot. Whoever holds it owns the
/// submission of that descriptor and must eventually fulfill it; peers
/// await the shared future installed at lock time.
pub(crate) struct WritePromise {
    tx: oneshot::Sender<ExecResult<CountersById>>,
}

impl WritePromise {
    pub(crate) fn fulfill(self, outcome: ExecResult<CountersById>) {
        let _ = self.tx.send(outcome);
    }
}

pub(crate) enum WriteSlot {
    /// The caller installed the slot and owns the submission.
    Owned(WritePromise),
    /// A prior evaluation owns the submission; await its outcome.
    Shared(SharedCounters),
}

pub(crate) struct EvalCache {
    writer: Arc<dyn Writer>,
    exec_table: Mutex<HashMap<ExecKey, CFuture<EvalValue>>>,
    write_table: Mutex<HashMap<WriteKey, SharedCounters>>,
}

impl EvalCache {
    pub(crate) fn new(writer: Arc<dyn Writer>) -> Self {
        Self {
            writer,
            exec_table: Mutex::new(HashMap::new()),
            write_table: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn writer(&self) -> &Arc<dyn Writer> {
        &self.writer
    }

    /// Atomic check-and-insert. Returns whether this caller installed the
    /// entry; `build` runs at most once per key.
    pub(crate) fn get_or_insert_with(
        &self,
        conf: &Config,
        node: &Arc<Node>,
        build: impl FnOnce() -> CFuture<EvalValue>,
    ) -> (bool, CFuture<EvalValue>) {
        let key = ExecKey {
            conf: conf.clone(),
            node: NodeKey(node.clone()),
        };
        let mut table = self.exec_table.lock().expect("exec table poisoned");
        if let Some(existing) = table.get(&key) {
            return (false, existing.clone());
        }
        let fresh = build();
        table.insert(key, fresh.clone());
        (true, fresh)
    }

    /// Lock a write descriptor. The first caller per key owns the
    /// submission and receives the promise; everyone after shares the
    /// installed future.
    pub(crate) fn get_or_lock(&self, conf: &Config, descriptor: &WriteDescriptor) -> WriteSlot {
        let key = WriteKey {
            conf: conf.clone(),
            descriptor: descriptor.clone(),
        };
        let mut table = self.write_table.lock().expect("write table poisoned");
        if let Some(existing) = table.get(&key) {
            return WriteSlot::Shared(existing.clone());
        }
        let (tx, rx) = oneshot::channel();
        let shared: SharedCounters = async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(ExecError::from(EngineError::EvaluationAborted)),
            }
        }
        .boxed()
        .shared();
        table.insert(key, shared);
        WriteSlot::Owned(WritePromise { tx })
    }

    /// A fresh memoization scope sharing the same writer, for isolating a
    /// sub-tree from the run's cache.
    pub(crate) fn clean_cache(&self) -> Arc<EvalCache> {
        Arc::new(EvalCache::new(self.writer.clone()))
    }

    #[cfg(test)]
    pub(crate) fn cached_nodes(&self) -> usize {
        self.exec_table.lock().expect("exec table poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::Counters;
    use crate::execution::ir::FutureFn;
    use crate::flow::Pipe;
    use crate::testing::MockSubmitter;
    use crate::writer::FlowWriter;

    fn cache() -> EvalCache {
        EvalCache::new(Arc::new(FlowWriter::new(MockSubmitter::new())))
    }

    fn leaf() -> Arc<Node> {
        let f: FutureFn = Arc::new(|_| Box::pin(futures::future::ready(Ok(Arc::new(1) as Dyn))));
        Node::future_const(f)
    }

    fn value_of(n: i64) -> CFuture<EvalValue> {
        CFuture::successful((Arc::new(n) as Dyn, CountersById::new()))
    }

    #[tokio::test]
    async fn second_lookup_returns_the_installed_future() {
        let cache = cache();
        let conf = Config::empty();
        let node = leaf();
        let (first, _) = cache.get_or_insert_with(&conf, &node, || value_of(1));
        assert!(first);
        let (second, cf) = cache.get_or_insert_with(&conf, &node, || panic!("must not rebuild"));
        assert!(!second);
        let (value, _) = cf.await_result().await.unwrap();
        assert_eq!(*super::super::ir::downcast::<i64>(value).unwrap(), 1);
    }

    #[tokio::test]
    async fn different_configs_do_not_share_entries() {
        let cache = cache();
        let node = leaf();
        let (a, _) = cache.get_or_insert_with(&Config::empty(), &node, || value_of(1));
        let (b, _) =
            cache.get_or_insert_with(&Config::empty().set("k", "v"), &node, || value_of(2));
        assert!(a && b);
        assert_eq!(cache.cached_nodes(), 2);
    }

    #[tokio::test]
    async fn write_lock_is_owned_once_then_shared() {
        let cache = cache();
        let conf = Config::empty();
        let descriptor = WriteDescriptor::Force {
            pipe: Pipe::named("events"),
        };
        let owned = cache.get_or_lock(&conf, &descriptor);
        let shared = cache.get_or_lock(&conf, &descriptor);
        let promise = match owned {
            WriteSlot::Owned(p) => p,
            WriteSlot::Shared(_) => panic!("first caller must own the write"),
        };
        let peer = match shared {
            WriteSlot::Shared(f) => f,
            WriteSlot::Owned(_) => panic!("second caller must share"),
        };

        let mut outcome = CountersById::new();
        outcome.insert(
            crate::counters::SubmissionId(1),
            Counters::empty().with(crate::counters::StatKey::new("io", "rows"), 3),
        );
        promise.fulfill(Ok(outcome));
        let seen = peer.await.unwrap();
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn dropped_promise_fails_peers_instead_of_hanging() {
        let cache = cache();
        let conf = Config::empty();
        let descriptor = WriteDescriptor::Force {
            pipe: Pipe::named("events"),
        };
        let owned = cache.get_or_lock(&conf, &descriptor);
        let peer = match cache.get_or_lock(&conf, &descriptor) {
            WriteSlot::Shared(f) => f,
            WriteSlot::Owned(_) => panic!("second caller must share"),
        };
        drop(owned);
        assert!(peer.await.is_err());
    }

    #[tokio::test]
    async fn clean_cache_shares_the_writer_but_not_entries() {
        let cache = cache();
        let conf = Config::empty();
        let node = leaf();
        cache.get_or_insert_with(&conf, &node, || value_of(1));
        let clean = cache.clean_cache();
        let (is_new, _) = clean.get_or_insert_with(&conf, &node, || value_of(2));
        assert!(is_new);
        assert!(Arc::ptr_eq(cache.writer(), clean.writer()));
    }
}
