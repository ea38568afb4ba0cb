//! IR rewrite rules.
//!
//! Three rules matter for planner efficiency: fusing `Mapped` chains,
//! inlining a `Mapped` into the result function of a `Write`, and merging
//! adjacent `Write` nodes joined by `Zipped` into one bundled `Write`. The
//! write-related rules also run unconditionally inside the `map` and `zip`
//! combinators (via [`map_node`] / [`zip_node`]): a submission that could
//! have been bundled but was not is lost planner work, not just lost time.
//!
//! The whole-tree pass is sharing-preserving: rewritten nodes are memoized
//! by source-node identity so a sub-graph referenced twice stays one node.

use super::ir::{Dyn, MapFn, Node, NodeKind, PresentFn};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;

/// `second ∘ first` in diagram order: the value flows through `first`,
/// then `second`.
pub(crate) fn compose_maps(first: MapFn, second: MapFn) -> MapFn {
    Arc::new(move |value| second(first(value)?))
}

/// Inline a map into a write's result function.
pub(crate) fn compose_present(present: PresentFn, f: MapFn) -> PresentFn {
    Arc::new(move |conf, mode, writer, exec| {
        let inner = present(conf, mode, writer, exec);
        let f = f.clone();
        async move { f(inner.await?) }.boxed()
    })
}

/// Pair two result functions, running both after the merged submission.
/// The produced value has the same `(left, right)` shape a `Zipped` node
/// yields, so reshaping maps compose transparently.
pub(crate) fn merge_presents(left: PresentFn, right: PresentFn) -> PresentFn {
    Arc::new(move |conf, mode, writer, exec| {
        let lf = left(conf.clone(), mode.clone(), writer.clone(), exec.clone());
        let rf = right(conf, mode, writer, exec);
        async move {
            let (a, b) = futures::future::try_join(lf, rf).await?;
            Ok(Arc::new((a, b)) as Dyn)
        }
        .boxed()
    })
}

/// Build a `Mapped` node, inlining into a `Write`'s result function when
/// the previous node is a write. Always applied, independent of the
/// optimization flag.
pub(crate) fn map_node(prev: &Arc<Node>, f: MapFn) -> Arc<Node> {
    match &prev.kind {
        NodeKind::Write {
            descriptors,
            present,
        } => Node::write(descriptors.clone(), compose_present(present.clone(), f)),
        _ => Node::mapped(prev.clone(), f),
    }
}

/// Build a `Zipped` node, merging two adjacent writes into a single
/// bundled `Write`. Always applied, independent of the optimization flag.
pub(crate) fn zip_node(left: &Arc<Node>, right: &Arc<Node>) -> Arc<Node> {
    match (&left.kind, &right.kind) {
        (
            NodeKind::Write {
                descriptors: dl,
                present: pl,
            },
            NodeKind::Write {
                descriptors: dr,
                present: pr,
            },
        ) => {
            let mut descriptors = dl.clone();
            descriptors.extend(dr.iter().cloned());
            Node::write(descriptors, merge_presents(pl.clone(), pr.clone()))
        }
        _ => Node::zipped(left.clone(), right.clone()),
    }
}

/// Rewrite a whole tree, additionally fusing `Mapped` chains.
pub(crate) fn optimize(node: &Arc<Node>) -> Arc<Node> {
    let mut memo: HashMap<usize, Arc<Node>> = HashMap::new();
    let rewritten = rewrite(node, &mut memo);
    if !Arc::ptr_eq(node, &rewritten) {
        tracing::debug!("execution graph rewritten by optimizer");
    }
    rewritten
}

fn rewrite(node: &Arc<Node>, memo: &mut HashMap<usize, Arc<Node>>) -> Arc<Node> {
    let key = Arc::as_ptr(node) as usize;
    if let Some(done) = memo.get(&key) {
        return done.clone();
    }
    let rewritten = match &node.kind {
        NodeKind::Mapped { prev, f } => {
            let rewritten_prev = rewrite(prev, memo);
            match &rewritten_prev.kind {
                NodeKind::Mapped {
                    prev: inner,
                    f: first,
                } => map_node(inner, compose_maps(first.clone(), f.clone())),
                NodeKind::Write { .. } => map_node(&rewritten_prev, f.clone()),
                _ if Arc::ptr_eq(prev, &rewritten_prev) => node.clone(),
                _ => map_node(&rewritten_prev, f.clone()),
            }
        }
        NodeKind::Zipped { left, right } => {
            let new_left = rewrite(left, memo);
            let new_right = rewrite(right, memo);
            let mergeable = matches!(
                (&new_left.kind, &new_right.kind),
                (NodeKind::Write { .. }, NodeKind::Write { .. })
            );
            if !mergeable && Arc::ptr_eq(left, &new_left) && Arc::ptr_eq(right, &new_right) {
                node.clone()
            } else {
                zip_node(&new_left, &new_right)
            }
        }
        NodeKind::FlatMapped { prev, f } => {
            rebuild_unary(node, prev, memo, |p| Node::flat_mapped(p, f.clone()))
        }
        NodeKind::OnComplete { prev, side } => {
            rebuild_unary(node, prev, memo, |p| Node::on_complete(p, side.clone()))
        }
        NodeKind::RecoverWith { prev, handler } => {
            rebuild_unary(node, prev, memo, |p| Node::recover_with(p, handler.clone()))
        }
        NodeKind::GetCounters { prev } => rebuild_unary(node, prev, memo, Node::get_counters),
        NodeKind::ResetCounters { prev } => rebuild_unary(node, prev, memo, Node::reset_counters),
        NodeKind::TransformedConfig { prev, f } => {
            rebuild_unary(node, prev, memo, |p| Node::transformed_config(p, f.clone()))
        }
        NodeKind::WithNewCache { prev } => rebuild_unary(node, prev, memo, Node::with_new_cache),
        NodeKind::FutureConst { .. }
        | NodeKind::FlowDefFn { .. }
        | NodeKind::UniqueIdFn { .. }
        | NodeKind::Reader
        | NodeKind::Write { .. } => node.clone(),
    };
    memo.insert(key, rewritten.clone());
    rewritten
}

fn rebuild_unary(
    node: &Arc<Node>,
    prev: &Arc<Node>,
    memo: &mut HashMap<usize, Arc<Node>>,
    build: impl FnOnce(Arc<Node>) -> Arc<Node>,
) -> Arc<Node> {
    let rewritten = rewrite(prev, memo);
    if Arc::ptr_eq(prev, &rewritten) {
        node.clone()
    } else {
        build(rewritten)
    }
}
