//! The execution IR: immutable, shareable nodes with cached structural
//! hashes.
//!
//! Values are type-erased inside the IR; the public `Execution<T>` wrapper
//! restores types at the boundary by downcast. Function positions compare
//! by `Arc` pointer identity: cloned handles are equal, closures built
//! fresh per call are not. Structural equality is memoized over reference
//! pairs so shared sub-graphs (`Zipped` diamonds in particular) never cost
//! exponential work.

use crate::config::{Config, UniqueId};
use crate::error::{EngineError, ExecError, ExecResult};
use crate::executor::Executor;
use crate::flow::{FlowDef, WriteDescriptor};
use crate::writer::Writer;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A type-erased execution value.
pub(crate) type Dyn = Arc<dyn Any + Send + Sync>;

pub(crate) type FutureFn =
    Arc<dyn Fn(&Executor) -> BoxFuture<'static, ExecResult<Dyn>> + Send + Sync>;
pub(crate) type MapFn = Arc<dyn Fn(Dyn) -> ExecResult<Dyn> + Send + Sync>;
pub(crate) type FlatMapFn = Arc<dyn Fn(Dyn) -> ExecResult<Arc<Node>> + Send + Sync>;
pub(crate) type SideFn =
    Arc<dyn Fn(&Result<Dyn, ExecError>) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type RecoverFn = Arc<dyn Fn(&ExecError) -> Option<Arc<Node>> + Send + Sync>;
pub(crate) type ConfigFn = Arc<dyn Fn(&Config) -> Config + Send + Sync>;
pub(crate) type UniqueIdFn = Arc<dyn Fn(&UniqueId) -> Arc<Node> + Send + Sync>;
pub(crate) type FlowFn =
    Arc<dyn Fn(&Config, &crate::config::Mode) -> anyhow::Result<FlowDef> + Send + Sync>;
pub(crate) type PresentFn = Arc<
    dyn Fn(
            Config,
            crate::config::Mode,
            Arc<dyn Writer>,
            Executor,
        ) -> BoxFuture<'static, ExecResult<Dyn>>
        + Send
        + Sync,
>;

/// Restore a type-erased value. Failure is an engine logic bug surfaced as
/// an error rather than a panic.
pub(crate) fn downcast<T: Send + Sync + 'static>(value: Dyn) -> ExecResult<Arc<T>> {
    value.downcast::<T>().map_err(|_| {
        EngineError::ValueTypeMismatch {
            expected: std::any::type_name::<T>(),
        }
        .into()
    })
}

pub(crate) enum NodeKind {
    /// Deferred producer run on the caller's executor; never memoized.
    FutureConst { f: FutureFn },
    /// A raw planner description submitted through the writer.
    FlowDefFn { f: FlowFn },
    Mapped { prev: Arc<Node>, f: MapFn },
    FlatMapped { prev: Arc<Node>, f: FlatMapFn },
    Zipped { left: Arc<Node>, right: Arc<Node> },
    /// Fire-and-forget side effect serialized after `prev`; never memoized.
    OnComplete { prev: Arc<Node>, side: SideFn },
    RecoverWith { prev: Arc<Node>, handler: RecoverFn },
    GetCounters { prev: Arc<Node> },
    ResetCounters { prev: Arc<Node> },
    TransformedConfig { prev: Arc<Node>, f: ConfigFn },
    WithNewCache { prev: Arc<Node> },
    UniqueIdFn { f: UniqueIdFn },
    /// Identity node yielding `(config, mode)`.
    Reader,
    /// One or more write descriptors plus the function producing the
    /// user-visible value after submission.
    Write {
        descriptors: Vec<WriteDescriptor>,
        present: PresentFn,
    },
}

pub(crate) struct Node {
    hash: u64,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub(crate) fn new(kind: NodeKind) -> Arc<Node> {
        let hash = hash_kind(&kind);
        Arc::new(Node { hash, kind })
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }

    pub(crate) fn future_const(f: FutureFn) -> Arc<Node> {
        Self::new(NodeKind::FutureConst { f })
    }

    pub(crate) fn flow_def(f: FlowFn) -> Arc<Node> {
        Self::new(NodeKind::FlowDefFn { f })
    }

    pub(crate) fn mapped(prev: Arc<Node>, f: MapFn) -> Arc<Node> {
        Self::new(NodeKind::Mapped { prev, f })
    }

    pub(crate) fn flat_mapped(prev: Arc<Node>, f: FlatMapFn) -> Arc<Node> {
        Self::new(NodeKind::FlatMapped { prev, f })
    }

    pub(crate) fn zipped(left: Arc<Node>, right: Arc<Node>) -> Arc<Node> {
        Self::new(NodeKind::Zipped { left, right })
    }

    pub(crate) fn on_complete(prev: Arc<Node>, side: SideFn) -> Arc<Node> {
        Self::new(NodeKind::OnComplete { prev, side })
    }

    pub(crate) fn recover_with(prev: Arc<Node>, handler: RecoverFn) -> Arc<Node> {
        Self::new(NodeKind::RecoverWith { prev, handler })
    }

    pub(crate) fn get_counters(prev: Arc<Node>) -> Arc<Node> {
        Self::new(NodeKind::GetCounters { prev })
    }

    pub(crate) fn reset_counters(prev: Arc<Node>) -> Arc<Node> {
        Self::new(NodeKind::ResetCounters { prev })
    }

    pub(crate) fn transformed_config(prev: Arc<Node>, f: ConfigFn) -> Arc<Node> {
        Self::new(NodeKind::TransformedConfig { prev, f })
    }

    pub(crate) fn with_new_cache(prev: Arc<Node>) -> Arc<Node> {
        Self::new(NodeKind::WithNewCache { prev })
    }

    pub(crate) fn unique_id(f: UniqueIdFn) -> Arc<Node> {
        Self::new(NodeKind::UniqueIdFn { f })
    }

    pub(crate) fn reader() -> Arc<Node> {
        Self::new(NodeKind::Reader)
    }

    pub(crate) fn write(descriptors: Vec<WriteDescriptor>, present: PresentFn) -> Arc<Node> {
        debug_assert!(!descriptors.is_empty(), "write node needs a descriptor");
        Self::new(NodeKind::Write {
            descriptors,
            present,
        })
    }
}

fn fn_addr<T: ?Sized>(f: &Arc<T>) -> usize {
    Arc::as_ptr(f) as *const () as usize
}

fn hash_kind(kind: &NodeKind) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    match kind {
        NodeKind::FutureConst { f } => {
            0u8.hash(&mut hasher);
            fn_addr(f).hash(&mut hasher);
        }
        NodeKind::FlowDefFn { f } => {
            1u8.hash(&mut hasher);
            fn_addr(f).hash(&mut hasher);
        }
        NodeKind::Mapped { prev, f } => {
            2u8.hash(&mut hasher);
            prev.hash.hash(&mut hasher);
            fn_addr(f).hash(&mut hasher);
        }
        NodeKind::FlatMapped { prev, f } => {
            3u8.hash(&mut hasher);
            prev.hash.hash(&mut hasher);
            fn_addr(f).hash(&mut hasher);
        }
        NodeKind::Zipped { left, right } => {
            4u8.hash(&mut hasher);
            left.hash.hash(&mut hasher);
            right.hash.hash(&mut hasher);
        }
        NodeKind::OnComplete { prev, side } => {
            5u8.hash(&mut hasher);
            prev.hash.hash(&mut hasher);
            fn_addr(side).hash(&mut hasher);
        }
        NodeKind::RecoverWith { prev, handler } => {
            6u8.hash(&mut hasher);
            prev.hash.hash(&mut hasher);
            fn_addr(handler).hash(&mut hasher);
        }
        NodeKind::GetCounters { prev } => {
            7u8.hash(&mut hasher);
            prev.hash.hash(&mut hasher);
        }
        NodeKind::ResetCounters { prev } => {
            8u8.hash(&mut hasher);
            prev.hash.hash(&mut hasher);
        }
        NodeKind::TransformedConfig { prev, f } => {
            9u8.hash(&mut hasher);
            prev.hash.hash(&mut hasher);
            fn_addr(f).hash(&mut hasher);
        }
        NodeKind::WithNewCache { prev } => {
            10u8.hash(&mut hasher);
            prev.hash.hash(&mut hasher);
        }
        NodeKind::UniqueIdFn { f } => {
            11u8.hash(&mut hasher);
            fn_addr(f).hash(&mut hasher);
        }
        NodeKind::Reader => {
            12u8.hash(&mut hasher);
        }
        NodeKind::Write {
            descriptors,
            present,
        } => {
            13u8.hash(&mut hasher);
            descriptors.hash(&mut hasher);
            fn_addr(present).hash(&mut hasher);
        }
    }
    hasher.finish()
}

type EqMemo = HashMap<(usize, usize), bool>;

/// Structural equality with reference-pair memoization.
pub(crate) fn structurally_eq(a: &Arc<Node>, b: &Arc<Node>) -> bool {
    let mut memo = EqMemo::new();
    eq_rec(a, b, &mut memo)
}

fn eq_rec(a: &Arc<Node>, b: &Arc<Node>, memo: &mut EqMemo) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    if a.hash != b.hash {
        return false;
    }
    let key = (Arc::as_ptr(a) as usize, Arc::as_ptr(b) as usize);
    if let Some(known) = memo.get(&key) {
        return *known;
    }
    let equal = match (&a.kind, &b.kind) {
        (NodeKind::FutureConst { f: fa }, NodeKind::FutureConst { f: fb }) => Arc::ptr_eq(fa, fb),
        (NodeKind::FlowDefFn { f: fa }, NodeKind::FlowDefFn { f: fb }) => Arc::ptr_eq(fa, fb),
        (NodeKind::Mapped { prev: pa, f: fa }, NodeKind::Mapped { prev: pb, f: fb }) => {
            Arc::ptr_eq(fa, fb) && eq_rec(pa, pb, memo)
        }
        (NodeKind::FlatMapped { prev: pa, f: fa }, NodeKind::FlatMapped { prev: pb, f: fb }) => {
            Arc::ptr_eq(fa, fb) && eq_rec(pa, pb, memo)
        }
        (
            NodeKind::Zipped {
                left: la,
                right: ra,
            },
            NodeKind::Zipped {
                left: lb,
                right: rb,
            },
        ) => eq_rec(la, lb, memo) && eq_rec(ra, rb, memo),
        (
            NodeKind::OnComplete { prev: pa, side: sa },
            NodeKind::OnComplete { prev: pb, side: sb },
        ) => Arc::ptr_eq(sa, sb) && eq_rec(pa, pb, memo),
        (
            NodeKind::RecoverWith {
                prev: pa,
                handler: ha,
            },
            NodeKind::RecoverWith {
                prev: pb,
                handler: hb,
            },
        ) => Arc::ptr_eq(ha, hb) && eq_rec(pa, pb, memo),
        (NodeKind::GetCounters { prev: pa }, NodeKind::GetCounters { prev: pb }) => {
            eq_rec(pa, pb, memo)
        }
        (NodeKind::ResetCounters { prev: pa }, NodeKind::ResetCounters { prev: pb }) => {
            eq_rec(pa, pb, memo)
        }
        (
            NodeKind::TransformedConfig { prev: pa, f: fa },
            NodeKind::TransformedConfig { prev: pb, f: fb },
        ) => Arc::ptr_eq(fa, fb) && eq_rec(pa, pb, memo),
        (NodeKind::WithNewCache { prev: pa }, NodeKind::WithNewCache { prev: pb }) => {
            eq_rec(pa, pb, memo)
        }
        (NodeKind::UniqueIdFn { f: fa }, NodeKind::UniqueIdFn { f: fb }) => Arc::ptr_eq(fa, fb),
        (NodeKind::Reader, NodeKind::Reader) => true,
        (
            NodeKind::Write {
                descriptors: da,
                present: pa,
            },
            NodeKind::Write {
                descriptors: db,
                present: pb,
            },
        ) => da == db && Arc::ptr_eq(pa, pb),
        _ => false,
    };
    memo.insert(key, equal);
    equal
}

/// A hashable, comparable handle to a node, for use as a cache key.
#[derive(Clone)]
pub(crate) struct NodeKey(pub(crate) Arc<Node>);

impl PartialEq for NodeKey {
    fn eq(&self, other: &Self) -> bool {
        structurally_eq(&self.0, &other.0)
    }
}

impl Eq for NodeKey {}

impl Hash for NodeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}
