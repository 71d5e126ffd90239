//! Graph node traits and edge bookkeeping.
//!
//! The dependency graph has two directions:
//!
//! - Downstream ("children"): a signal keeps weak references to the
//!   computations that depend on it, so it can notify them. Weak links
//!   mean dropping a node never requires graph-wide cleanup; dead
//!   children are simply skipped during traversal.
//!
//! - Upstream ("parents"): a computation keeps strong references to the
//!   signals it dereferenced during its last run, in order, together with
//!   an epoch snapshot per parent. This list is rewritten only inside a
//!   capture session for that computation.
//!
//! Atoms implement only the parent side (`SignalNode`), effects only the
//! child side (`DependentNode`), and computed signals both.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::reactive::array_set::ArraySet;
use crate::reactive::epoch::Epoch;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A weak, non-owning reference to a dependent node, used as the element
/// type of a signal's children set. Identity is the node ID, so a dead
/// weak pointer still compares and hashes consistently.
#[derive(Clone, Debug)]
pub(crate) struct ChildRef {
    pub id: NodeId,
    pub node: Weak<dyn DependentNode>,
}

impl PartialEq for ChildRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChildRef {}

impl Hash for ChildRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A computation's parents and the epoch snapshot taken per parent.
///
/// The two arrays are parallel: `epochs[i]` is the value of
/// `parents[i].last_changed_epoch()` observed during the most recent
/// successful run of the owning computation.
#[derive(Default)]
pub(crate) struct ParentList {
    pub parents: SmallVec<[Arc<dyn SignalNode>; 4]>,
    pub epochs: SmallVec<[Epoch; 4]>,
}

/// The parent side of a graph node: something whose value can be read and
/// depended upon (an atom or a computed signal).
pub(crate) trait SignalNode: Send + Sync {
    fn id(&self) -> NodeId;

    fn name(&self) -> &str;

    /// The epoch at which this node's value last actually changed.
    fn last_changed_epoch(&self) -> Epoch;

    /// Bring the node's value up to date without registering a capture.
    /// A no-op for atoms; computed signals recompute if stale.
    fn pull(&self);

    /// The dependents registered on this node.
    fn children(&self) -> &Mutex<ArraySet<ChildRef>>;

    /// This node's own identity as a dependent, if it is one (computed
    /// signals are both a signal and a dependent).
    fn as_child_ref(&self) -> Option<ChildRef>;

    /// A snapshot of this node's own parents, for recursive attach and
    /// detach. Empty for atoms.
    fn parent_snapshot(&self) -> Vec<Arc<dyn SignalNode>>;
}

/// The child side of a graph node: something that depends on signals (a
/// computed signal or an effect scheduler). Identity lives on the
/// [`ChildRef`] returned by `child_ref`.
pub(crate) trait DependentNode: Send + Sync {
    fn name(&self) -> &str;

    /// The parents this node dereferenced during its last run.
    fn parent_list(&self) -> &Mutex<ParentList>;

    /// Whether this node is part of an actively listening effect graph.
    fn is_actively_listening(&self) -> bool;

    /// This node's identity as a child of its parents.
    fn child_ref(&self) -> ChildRef;

    /// The epoch when this node was last visited by a notification flush.
    /// Used to avoid revisiting shared subgraphs within one flush.
    fn last_traversed_epoch(&self) -> Epoch;

    fn set_last_traversed_epoch(&self, epoch: Epoch);

    /// The children to continue a flush traversal through, or `None` if
    /// this node is a sink (an effect scheduler).
    fn children_for_traversal(&self) -> Option<&Mutex<ArraySet<ChildRef>>>;

    /// Ask the node to schedule its effect if its dependencies changed.
    /// Only meaningful for effect schedulers; a no-op elsewhere.
    fn maybe_schedule_effect(&self);
}

/// An externally settable source (an atom), as seen by the transaction
/// manager: it can be restored to a previously recorded value and its
/// diff history can be invalidated after a rollback.
pub(crate) trait SourceNode: SignalNode {
    /// Set the source back to `value` through the normal set path. The
    /// value is the type-erased original recorded when the transaction
    /// first touched this source.
    fn restore(&self, value: &(dyn std::any::Any + Send));

    /// Drop the source's diff history. After a rollback the history is
    /// discontinuous and cannot be trusted.
    fn clear_history(&self);
}

/// Register `child` as a dependent of `parent`.
///
/// When a derived parent gains its first listener it must itself stay
/// wired to its own parents, so registration recurses upstream. The
/// recursion terminates because `add` returns false for edges that
/// already exist.
pub(crate) fn attach(parent: &Arc<dyn SignalNode>, child: &ChildRef) {
    if !parent.children().lock().add(child.clone()) {
        return;
    }

    if let Some(self_ref) = parent.as_child_ref() {
        for grandparent in parent.parent_snapshot() {
            attach(&grandparent, &self_ref);
        }
    }
}

/// Unregister `child` as a dependent of `parent`. A derived parent whose
/// last listener leaves unwires itself from its own parents.
pub(crate) fn detach(parent: &Arc<dyn SignalNode>, child: &ChildRef) {
    if !parent.children().lock().remove(child) {
        return;
    }

    if parent.children().lock().is_empty() {
        if let Some(self_ref) = parent.as_child_ref() {
            for grandparent in parent.parent_snapshot() {
                detach(&grandparent, &self_ref);
            }
        }
    }
}

/// Check whether any of `child`'s parents changed past the epoch snapshot
/// taken during its last run. Each parent is pulled up to date first, so
/// a stale derived parent recomputes (and possibly changes) before the
/// comparison.
pub(crate) fn have_parents_changed(child: &dyn DependentNode) -> bool {
    let snapshot: SmallVec<[(Arc<dyn SignalNode>, Epoch); 4]> = {
        let list = child.parent_list().lock();
        list.parents
            .iter()
            .cloned()
            .zip(list.epochs.iter().copied())
            .collect()
    };

    for (parent, epoch) in snapshot {
        parent.pull();
        if parent.last_changed_epoch() != epoch {
            return true;
        }
    }

    false
}
